//! Adaptive convergence: only recently changed regions may shed band entries.
//!
//! Every `interval` iterations the live labels are diffed against the last
//! snapshot over the active list, the change mask is dilated a few cycles
//! through active voxels, and a new snapshot is taken. Between samples, band
//! deletion is restricted to flagged voxels.

use rayon::prelude::*;

use super::LevelSetField;

/// Label history and dilated change mask gating active list deletion.
pub struct ConvergenceTracker {
    interval: u64,
    cycles: usize,
    history: Vec<u32>,
    flagged: Vec<bool>,
    /// Flag list of the last sample; used to clear `flagged` cheaply.
    marked: Vec<usize>,
    diffed: bool,
}

impl ConvergenceTracker {
    /// Tracker with its first snapshot taken from `field`.
    pub fn new(field: &LevelSetField, interval: u64, cycles: usize) -> Self {
        Self {
            interval: interval.max(1),
            cycles,
            history: field.labels.clone(),
            flagged: vec![false; field.dims.len()],
            marked: Vec::new(),
            diffed: false,
        }
    }

    /// Record iteration `iteration`. Samples on multiples of the interval.
    pub fn observe(&mut self, iteration: u64, field: &LevelSetField, active: &[usize]) {
        if iteration % self.interval != 0 {
            return;
        }

        for &i in &self.marked {
            self.flagged[i] = false;
        }
        let history = &self.history;
        let mut marked: Vec<usize> = active
            .par_iter()
            .copied()
            .filter(|&i| field.labels[i] != history[i])
            .collect();
        for &i in &marked {
            self.flagged[i] = true;
        }
        let changed = marked.len();

        let dims = field.dims;
        let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); dims.parity_classes()];
        for &i in active {
            by_class[dims.parity(i)].push(i);
        }
        let mut members = Vec::new();
        if self.cycles > 0 {
            members.resize(dims.len(), false);
            for &i in active {
                members[i] = true;
            }
        }

        for _ in 0..self.cycles {
            for class in &by_class {
                let grown: Vec<usize> = {
                    let flagged = &self.flagged;
                    let members = &members;
                    class
                        .par_iter()
                        .copied()
                        .filter(|&i| {
                            !flagged[i] && dims.face_neighbors(i).any(|n| members[n] && flagged[n])
                        })
                        .collect()
                };
                for &i in &grown {
                    self.flagged[i] = true;
                }
                marked.extend_from_slice(&grown);
            }
        }

        log::debug!(
            "Convergence sample at {}: {} changed, {} flagged after {} dilations",
            iteration,
            changed,
            marked.len(),
            self.cycles
        );

        self.marked = marked;
        self.history
            .par_iter_mut()
            .zip(field.labels.par_iter())
            .for_each(|(h, &l)| *h = l);
        self.diffed = true;
    }

    /// Whether an out-of-band entry may be dropped from the active list.
    #[inline]
    pub fn allows_deletion(&self, i: usize) -> bool {
        !self.diffed || self.flagged[i]
    }

    /// Voxels flagged at the last sample.
    pub fn flagged_count(&self) -> usize {
        self.marked.len()
    }
}
