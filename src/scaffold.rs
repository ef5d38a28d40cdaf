//! Turning a priced tree into unsigned transaction scaffolds.
//!
//! Every inner node of the tree becomes one transaction: it spends the output
//! its parent created for it (or, at the root, a prior output of the wallet) and
//! pays one output per child. Script building and signing happen elsewhere.

use crate::painting::Asset;
use crate::sizer::SizedTree;
use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableOutput {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputScaffold<T> {
    /// Root of the tree, funded from outside it.
    Init { from: T, outpoint: SpendableOutput },
    /// Spends output `vout` of an earlier scaffold in the same plan.
    Prev { prev_scaffold_id: usize, vout: u32, from: T },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputScaffold<T> {
    pub to: T,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxScaffold<T> {
    pub id: usize,
    pub asset: Asset,
    pub input: InputScaffold<T>,
    pub outs: Vec<OutputScaffold<T>>,
}

/// Boundary with the transaction serializer.
pub trait TransactionAssembler<T> {
    fn assemble(
        &self,
        asset: Asset,
        xpub: &str,
        tree: &SizedTree<T>,
        spendable: &[SpendableOutput],
    ) -> Result<Vec<TxScaffold<T>>>;
}

/// Plans scaffolds in pre-order, so a parent always precedes its children.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScaffoldAssembler;

impl<T: Clone> TransactionAssembler<T> for ScaffoldAssembler {
    fn assemble(
        &self,
        asset: Asset,
        xpub: &str,
        tree: &SizedTree<T>,
        spendable: &[SpendableOutput],
    ) -> Result<Vec<TxScaffold<T>>> {
        if xpub.is_empty() {
            bail!("an extended public key is required to plan transactions");
        }
        let needed = tree.amount.context("tree must be tagged with amounts before assembly")?;
        if tree.is_leaf() {
            return Ok(Vec::new());
        }
        let funding = spendable
            .iter()
            .find(|o| o.value >= needed)
            .with_context(|| format!("no spendable output covers {} sat", needed))?;

        let mut plan = Vec::new();
        let root_input = InputScaffold::Init { from: tree.src.clone(), outpoint: funding.clone() };
        plan_node(tree, root_input, asset, &mut plan)?;
        Ok(plan)
    }
}

fn plan_node<T: Clone>(
    node: &SizedTree<T>,
    input: InputScaffold<T>,
    asset: Asset,
    plan: &mut Vec<TxScaffold<T>>,
) -> Result<()> {
    let id = plan.len();
    let mut outs = Vec::with_capacity(node.tree.len());
    for child in &node.tree {
        let amount = child.amount.context("every node must carry an amount")?;
        outs.push(OutputScaffold { to: child.src.clone(), amount });
    }
    plan.push(TxScaffold { id, asset, input, outs });

    for (vout, child) in node.tree.iter().enumerate() {
        if child.is_leaf() {
            continue;
        }
        let input = InputScaffold::Prev { prev_scaffold_id: id, vout: vout as u32, from: child.src.clone() };
        plan_node(child, input, asset, plan)?;
    }
    Ok(())
}
