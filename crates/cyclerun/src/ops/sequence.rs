use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cycles::Cycle;

/// How ratio-weighted templates are laid out in the cycle sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerKind {
    /// Round robin over templates, each taking a turn while it has ratio left.
    #[default]
    Bucket,
    /// Each template's full ratio as one contiguous run.
    Concat,
}

impl FromStr for SequencerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bucket" => Ok(SequencerKind::Bucket),
            "concat" => Ok(SequencerKind::Concat),
            other => Err(format!("unknown sequencer `{other}` (expected bucket or concat)")),
        }
    }
}

/// Deterministic cycle-to-entry lookup table built from ratios.
#[derive(Clone, Debug)]
pub struct OpSequence<T> {
    entries: Vec<T>,
    order: Vec<usize>,
}

impl<T> OpSequence<T> {
    /// Entries with a zero ratio are dropped. Fails when nothing remains.
    pub fn build(weighted: Vec<(T, u32)>, kind: SequencerKind) -> Result<Self, String> {
        let (entries, ratios): (Vec<T>, Vec<u32>) =
            weighted.into_iter().filter(|(_, ratio)| *ratio > 0).unzip();
        if entries.is_empty() {
            return Err("op sequence has no templates with a positive ratio".to_string());
        }

        let total: usize = ratios.iter().map(|ratio| *ratio as usize).sum();
        let mut order = Vec::with_capacity(total);
        match kind {
            SequencerKind::Concat => {
                for (index, ratio) in ratios.iter().enumerate() {
                    order.extend(std::iter::repeat_n(index, *ratio as usize));
                }
            }
            SequencerKind::Bucket => {
                let mut left = ratios.clone();
                while order.len() < total {
                    for (index, remaining) in left.iter_mut().enumerate() {
                        if *remaining > 0 {
                            *remaining -= 1;
                            order.push(index);
                        }
                    }
                }
            }
        }
        Ok(Self { entries, order })
    }

    pub fn select(&self, cycle: Cycle) -> &T {
        let position = (cycle % self.order.len() as u64) as usize;
        &self.entries[self.order[position]]
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }
}
