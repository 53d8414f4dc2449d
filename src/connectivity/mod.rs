//! Fixel-fixel connectivity from streamline tractography
//!
//! For every streamline: assign each (voxel, tangent, length) sample to the
//! best-matching fixel in that voxel (angular gate), accumulate per-fixel
//! track density, and count co-traversals for every unordered fixel pair the
//! streamline visits. Streamlines are independent, so the build runs as a
//! loader -> mapper pipeline over a bounded channel with batched commits into
//! the shared graph.
//!
//! The raw graph is symmetric in streamline counts; [`normalise`] then turns
//! counts into per-row fractions (no longer symmetric), prunes, and derives
//! the smoothing kernel.

pub mod normalise;

pub use normalise::{normalise, ConnectivityGraph, NormaliseOptions, SmoothingWeights};

use std::collections::BTreeMap;
use std::io::{BufRead, Seek};
use std::sync::Mutex;

use crossbeam_channel::bounded;

use crate::error::{FixelError, FixelResult};
use crate::fixel::FixelAtlas;
use crate::mapper::{TrackMapper, VoxelSample};
use crate::tracks::{Streamline, TrackReader};

/// Streamlines per work item; amortises channel and mutex traffic
const BATCH_SIZE: usize = 128;

/// Raw connectivity accumulated during the build phase
pub struct GraphBuild {
    /// Per-fixel co-traversal counts, stored in both directions
    pub edges: Vec<BTreeMap<u32, u32>>,
    /// Per-fixel track density: summed streamline length through the fixel
    pub tdi: Vec<f64>,
}

impl GraphBuild {
    pub fn new(num_fixels: usize) -> Self {
        GraphBuild {
            edges: vec![BTreeMap::new(); num_fixels],
            tdi: vec![0.0; num_fixels],
        }
    }

    /// Commit one streamline's fixel visits.
    ///
    /// Both directions of each pair are incremented together, so the graph is
    /// symmetric whenever no commit is in flight.
    fn commit(&mut self, visits: &[(u32, f64)]) {
        for &(fixel, length) in visits {
            self.tdi[fixel as usize] += length;
        }
        for (n, &(a, _)) in visits.iter().enumerate() {
            for &(b, _) in &visits[n + 1..] {
                *self.edges[a as usize].entry(b).or_insert(0) += 1;
                *self.edges[b as usize].entry(a).or_insert(0) += 1;
            }
        }
    }
}

/// Assigns voxel samples to fixels under an angular threshold
pub struct TrackProcessor<'a> {
    atlas: &'a FixelAtlas,
    /// cos of the angular threshold; |tangent . direction| below this is rejected
    cos_threshold: f64,
}

impl<'a> TrackProcessor<'a> {
    pub fn new(atlas: &'a FixelAtlas, angular_threshold_degrees: f64) -> Self {
        TrackProcessor {
            atlas,
            cos_threshold: angular_threshold_degrees.to_radians().cos(),
        }
    }

    /// Pick the best fixel for each sample; samples failing the angular gate
    /// are discarded. Voxel samples are already unique per streamline, so the
    /// result holds at most one entry per traversed voxel.
    pub fn assign(&self, samples: &[VoxelSample]) -> Vec<(u32, f64)> {
        let mut visits = Vec::with_capacity(samples.len());
        for sample in samples {
            let mut best: Option<(usize, f64)> = None;
            for fixel in self.atlas.fixels_in_voxel(sample.voxel) {
                let d = self.atlas.direction(fixel);
                let dot = (sample.tangent[0] * d[0]
                    + sample.tangent[1] * d[1]
                    + sample.tangent[2] * d[2])
                    .abs();
                if best.map(|(_, b)| dot > b).unwrap_or(true) {
                    best = Some((fixel, dot));
                }
            }
            if let Some((fixel, dot)) = best {
                if dot >= self.cos_threshold {
                    visits.push((fixel as u32, sample.length));
                }
            }
        }
        visits
    }
}

/// Build the raw connectivity graph from a track file.
///
/// The reader is drained on the calling thread (the file is serial); mapping
/// and fixel assignment run on `threads` workers fed through a bounded
/// channel. `on_track` is invoked once per processed streamline.
pub fn build_connectivity<R, F>(
    atlas: &FixelAtlas,
    reader: TrackReader<R>,
    voxel_size: [f64; 3],
    angular_threshold_degrees: f64,
    threads: usize,
    on_track: F,
) -> FixelResult<GraphBuild>
where
    R: BufRead + Seek,
    F: Fn() + Sync,
{
    let step_size = reader
        .property("step_size")
        .and_then(|v| v.parse::<f64>().ok());
    let mapper = TrackMapper::new(atlas, voxel_size, step_size);
    let processor = TrackProcessor::new(atlas, angular_threshold_degrees);
    let graph = Mutex::new(GraphBuild::new(atlas.num_fixels()));
    let threads = threads.max(1);

    let (batch_tx, batch_rx) = bounded::<Vec<Streamline>>(threads * 2);
    let mut read_error = None;

    std::thread::scope(|scope| {
        for _ in 0..threads {
            let batch_rx = batch_rx.clone();
            let mapper = &mapper;
            let processor = &processor;
            let graph = &graph;
            let on_track = &on_track;
            scope.spawn(move || {
                let mut local: Vec<Vec<(u32, f64)>> = Vec::with_capacity(BATCH_SIZE);
                for batch in batch_rx.iter() {
                    local.clear();
                    for streamline in &batch {
                        let samples = mapper.map(streamline);
                        local.push(processor.assign(&samples));
                        on_track();
                    }
                    let mut graph = graph.lock().unwrap();
                    for visits in &local {
                        graph.commit(visits);
                    }
                }
            });
        }
        drop(batch_rx);

        let mut batch = Vec::with_capacity(BATCH_SIZE);
        for streamline in reader {
            match streamline {
                Ok(s) => batch.push(s),
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
            if batch.len() >= BATCH_SIZE {
                if batch_tx.send(std::mem::take(&mut batch)).is_err() {
                    break;
                }
                batch = Vec::with_capacity(BATCH_SIZE);
            }
        }
        if !batch.is_empty() {
            let _ = batch_tx.send(batch);
        }
        drop(batch_tx);
    });

    if let Some(e) = read_error {
        return Err(e);
    }
    graph
        .into_inner()
        .map_err(|_| FixelError::Numerical("connectivity worker panicked".to_string()))
}
