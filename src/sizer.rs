//! Byte-size and fee annotations for a rooted transaction tree.
//!
//! Sizing runs bottom-up: every node carries enough vbytes for itself and
//! everything beneath it. Pricing then runs top-down at a chosen fee rate.

use crate::graph::StarTree;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;

// https://bitcoin.stackexchange.com/questions/87275/how-to-calculate-segwit-transaction-fee-in-bytes
// A P2WPKH spend is 68 vbytes; a P2WPKH output is 31 vbytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FeeSchedule {
    pub base_vbytes: u64,
    pub input_vbytes: u64,
    pub output_vbytes: u64,
    pub sink_fixed_vbytes: u64,
    /// Shared across all sinks of the tree, rounded up per sink.
    pub sink_shared_vbytes: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self { base_vbytes: 10, input_vbytes: 68, output_vbytes: 31, sink_fixed_vbytes: 68, sink_shared_vbytes: 10 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizedTree<T> {
    pub src: T,
    pub tree: Vec<SizedTree<T>>,
    pub bytes_at_and_below: Option<u64>,
    pub amount: Option<u64>,
}

impl<T: Clone> From<&StarTree<T>> for SizedTree<T> {
    fn from(s: &StarTree<T>) -> Self {
        Self {
            src: s.src.clone(),
            tree: s.tree.iter().map(SizedTree::from).collect(),
            bytes_at_and_below: None,
            amount: None,
        }
    }
}

impl<T> SizedTree<T> {
    pub fn is_leaf(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn sink_nodes(&self) -> Vec<&T> {
        if self.tree.is_empty() {
            return vec![&self.src];
        }
        self.tree.iter().flat_map(SizedTree::sink_nodes).collect()
    }

    fn fully_sized(&self) -> bool {
        self.bytes_at_and_below.is_some() && self.tree.iter().all(SizedTree::fully_sized)
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result
    where
        T: fmt::Display,
    {
        write!(f, "{}{}", "  ".repeat(depth), self.src)?;
        if let Some(b) = self.bytes_at_and_below {
            write!(f, "  {} vB", b)?;
        }
        if let Some(a) = self.amount {
            write!(f, "  {} sat", a)?;
        }
        writeln!(f)?;
        for child in &self.tree {
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl<T: fmt::Display> fmt::Display for SizedTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Untagged,
    TaggedWithBytes,
    TaggedWithAmounts,
}

pub struct TransactionWriter<T> {
    tree: SizedTree<T>,
    schedule: FeeSchedule,
    sink_count: u64,
    state: WriterState,
}

impl<T: Clone> TransactionWriter<T> {
    pub fn new(star: &StarTree<T>, schedule: FeeSchedule) -> Self {
        let tree = SizedTree::from(star);
        let sink_count = tree.sink_nodes().len() as u64;
        Self { tree, schedule, sink_count, state: WriterState::Untagged }
    }
}

impl<T> TransactionWriter<T> {
    pub fn sink_count(&self) -> u64 {
        self.sink_count
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn tree(&self) -> &SizedTree<T> {
        &self.tree
    }

    pub fn into_tree(self) -> SizedTree<T> {
        self.tree
    }

    /// Fee paid by the whole tree, once amounts are tagged.
    pub fn total_fee(&self) -> Option<u64> {
        self.tree.amount
    }

    pub fn sink_node_additional_vbytes(&self) -> u64 {
        self.schedule.sink_fixed_vbytes.saturating_add(self.schedule.sink_shared_vbytes.div_ceil(self.sink_count.max(1)))
    }

    /// Tag every node with the vbytes at and below it; returns the root's.
    pub fn tag_with_vbytes_beneath(&mut self) -> Result<u64> {
        let schedule = self.schedule;
        let sink_extra = self.sink_node_additional_vbytes();
        let total = tag_bytes(&mut self.tree, &schedule, sink_extra, 1)
            .context("vbyte total does not fit in u64")?;
        if self.state == WriterState::Untagged {
            self.state = WriterState::TaggedWithBytes;
        }
        Ok(total)
    }

    /// Price every node at `fee_per_vbyte`. Sizing must have run first and every
    /// amount must fit in a u64; the tree is left untouched otherwise.
    pub fn tag_with_amounts(&mut self, fee_per_vbyte: u64) -> Result<()> {
        if !self.tree.fully_sized() {
            bail!("tree must be tagged with vbytes before amounts");
        }
        if !amounts_fit(&self.tree, fee_per_vbyte) {
            bail!("fee rate {} sat/vB overflows the amount of a {} vB tree", fee_per_vbyte, self.tree.bytes_at_and_below.unwrap_or_default());
        }
        tag_amounts(&mut self.tree, fee_per_vbyte);
        self.state = WriterState::TaggedWithAmounts;
        Ok(())
    }
}

fn tag_bytes<T>(s: &mut SizedTree<T>, schedule: &FeeSchedule, sink_extra: u64, input_count: u64) -> Option<u64> {
    if let Some(b) = s.bytes_at_and_below {
        return Some(b);
    }
    let own = input_count.checked_mul(schedule.input_vbytes)?.checked_add(schedule.base_vbytes)?;
    let bytes = if s.tree.is_empty() {
        own.checked_add(sink_extra)?
    } else {
        let mut sum = own;
        for child in s.tree.iter_mut() {
            let below = tag_bytes(child, schedule, sink_extra, 1)?;
            sum = sum.checked_add(below)?.checked_add(schedule.output_vbytes)?;
        }
        sum
    };
    s.bytes_at_and_below = Some(bytes);
    Some(bytes)
}

fn amounts_fit<T>(s: &SizedTree<T>, fee_per_vbyte: u64) -> bool {
    let own = s.amount.is_some() || s.bytes_at_and_below.map_or(true, |b| b.checked_mul(fee_per_vbyte).is_some());
    own && s.tree.iter().all(|child| amounts_fit(child, fee_per_vbyte))
}

fn tag_amounts<T>(s: &mut SizedTree<T>, fee_per_vbyte: u64) {
    if s.amount.is_none() {
        s.amount = s.bytes_at_and_below.map(|b| b * fee_per_vbyte);
    }
    for child in s.tree.iter_mut() {
        tag_amounts(child, fee_per_vbyte);
    }
}
