// src/feed.rs
//! Object data feed: chunk bounds from the streaming thread to the bounds buffer.
//!
//! The chunk manager publishes whole [`ChunkSnapshot`]s through a bounded channel.
//! A snapshot nobody has consumed yet is stale the moment a newer one exists, so
//! [`SnapshotSender::publish`] evicts it instead of blocking the streaming thread.
//! The render thread drains to the newest snapshot in [`ObjectDataFeed::poll`] and
//! swaps the host object list in one step under a mutex; the upload path therefore
//! only ever sees a complete list. Once the feed is dropped, `publish` fails so the
//! streaming thread can stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{bounded, Receiver, Sender};
use glam::Vec3;
use parking_lot::Mutex;

use crate::culling::ObjectBound;
use crate::error::{Error, Result};

/// Chunk coordinate in chunk units. Ordering is lexicographic (x, y, z), which is
/// also the order objects are laid out in the bounds buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkId {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkId {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// World‑space bounds of one chunk as the chunk manager reports them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkBounds {
    pub id: ChunkId,
    pub min: Vec3,
    pub max: Vec3,
    pub instance_count: u32,
}

/// Everything the streaming thread knows at one instant.
#[derive(Debug, Clone, Default)]
pub struct ChunkSnapshot {
    pub chunks: Vec<ChunkBounds>,
    pub player_position: Vec3,
}

/// Producer handle for the streaming thread.
#[derive(Clone)]
pub struct SnapshotSender {
    tx: Sender<ChunkSnapshot>,
    // Second receiver on the same channel, used only to evict stale snapshots.
    // It also keeps the channel connected, so liveness comes from `feed`.
    evict: Receiver<ChunkSnapshot>,
    feed: Weak<()>,
}

impl SnapshotSender {
    /// Hand `snapshot` over without blocking, replacing an unconsumed one.
    /// Fails once the [`ObjectDataFeed`] is gone.
    pub fn publish(&self, mut snapshot: ChunkSnapshot) -> Result<()> {
        if self.is_closed() {
            return Err(Error::msg("object data feed closed"));
        }
        while let Err(full) = self.tx.try_send(snapshot) {
            if self.evict.try_recv().is_ok() {
                log::trace!("dropped stale chunk snapshot");
            }
            snapshot = full.into_inner();
        }
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.feed.strong_count() == 0
    }
}

#[derive(Debug, Default)]
struct FeedState {
    bounds: Vec<ObjectBound>,
    ids: Vec<ChunkId>,
    player_position: Vec3,
    dirty: bool,
}

/// Host‑side object list plus the hand‑off channel feeding it.
pub struct ObjectDataFeed {
    tx: Sender<ChunkSnapshot>,
    rx: Receiver<ChunkSnapshot>,
    state: Mutex<FeedState>,
    version: AtomicU64,
    alive: Arc<()>,
}

impl ObjectDataFeed {
    /// `depth` snapshots may wait in the channel (1 keeps only the newest).
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self {
            tx,
            rx,
            state: Mutex::new(FeedState::default()),
            version: AtomicU64::new(0),
            alive: Arc::new(()),
        }
    }

    pub fn sender(&self) -> SnapshotSender {
        SnapshotSender {
            tx: self.tx.clone(),
            evict: self.rx.clone(),
            feed: Arc::downgrade(&self.alive),
        }
    }

    /// Drain the channel and apply the newest snapshot. Returns whether the object
    /// list changed.
    pub fn poll(&self) -> bool {
        let Some(latest) = self.rx.try_iter().last() else {
            return false;
        };
        self.apply(latest);
        true
    }

    /// Replace the object list directly from the render thread.
    pub fn apply(&self, snapshot: ChunkSnapshot) {
        let mut chunks = snapshot.chunks;
        chunks.sort_by_key(|c| c.id);
        let before = chunks.len();
        chunks.dedup_by_key(|c| c.id);
        if chunks.len() != before {
            log::warn!("snapshot listed {} duplicate chunk ids", before - chunks.len());
        }

        let bounds: Vec<ObjectBound> = chunks
            .iter()
            .map(|c| ObjectBound::new(c.min, c.max, c.instance_count))
            .collect();
        let ids = chunks.iter().map(|c| c.id).collect();

        {
            let mut state = self.state.lock();
            state.bounds = bounds;
            state.ids = ids;
            state.player_position = snapshot.player_position;
            state.dirty = true;
        }
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("object feed v{version}: {} chunks", chunks.len());
    }

    /// Call `f` with the current list if it changed since the last successful call.
    /// The list stays dirty when `f` fails.
    pub fn take_dirty<R>(&self, f: impl FnOnce(&[ObjectBound]) -> Result<R>) -> Option<Result<R>> {
        let mut state = self.state.lock();
        if !state.dirty {
            return None;
        }
        let result = f(&state.bounds);
        if result.is_ok() {
            state.dirty = false;
        }
        Some(result)
    }

    /// Copy of the current list.
    pub fn bounds(&self) -> Vec<ObjectBound> {
        self.state.lock().bounds.clone()
    }

    pub fn object_count(&self) -> u32 {
        self.state.lock().bounds.len() as u32
    }

    /// Chunk behind bounds‑buffer slot `index`.
    pub fn chunk_id(&self, index: u32) -> Option<ChunkId> {
        self.state.lock().ids.get(index as usize).copied()
    }

    pub fn player_position(&self) -> Vec3 {
        self.state.lock().player_position
    }

    /// Number of snapshots applied so far.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for ObjectDataFeed {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn chunk(x: i32, instances: u32) -> ChunkBounds {
        let min = Vec3::new(x as f32 * 16.0, 0.0, 0.0);
        ChunkBounds {
            id: ChunkId::new(x, 0, 0),
            min,
            max: min + Vec3::splat(16.0),
            instance_count: instances,
        }
    }

    #[test]
    fn newest_snapshot_wins_without_blocking() {
        let feed = ObjectDataFeed::new(1);
        let tx = feed.sender();
        for n in 1..=5 {
            tx.publish(ChunkSnapshot {
                chunks: (0..n).map(|x| chunk(x, 1)).collect(),
                player_position: Vec3::splat(n as f32),
            })
            .unwrap();
        }
        assert!(feed.poll());
        assert_eq!(feed.object_count(), 5);
        assert_eq!(feed.player_position(), Vec3::splat(5.0));
        assert!(!feed.poll());
    }

    #[test]
    fn objects_are_ordered_by_chunk_id() {
        let feed = ObjectDataFeed::default();
        feed.apply(ChunkSnapshot {
            chunks: vec![chunk(3, 30), chunk(-1, 10), chunk(2, 20), chunk(2, 99)],
            player_position: Vec3::ZERO,
        });
        let bounds = feed.bounds();
        assert_eq!(bounds.len(), 3);
        assert_eq!(feed.chunk_id(0), Some(ChunkId::new(-1, 0, 0)));
        assert_eq!(feed.chunk_id(2), Some(ChunkId::new(3, 0, 0)));
        assert_eq!(bounds[1].instance_count, 20);
        assert_eq!(bounds[0].min(), Vec3::new(-16.0, 0.0, 0.0));
        assert_eq!(feed.chunk_id(3), None);
    }

    #[test]
    fn dirty_flag_is_consumed_once_on_success() {
        let feed = ObjectDataFeed::default();
        assert!(feed.take_dirty(|b| Ok(b.len())).is_none());
        feed.apply(ChunkSnapshot {
            chunks: vec![chunk(0, 1)],
            player_position: Vec3::ZERO,
        });
        // A failed upload leaves the list dirty.
        assert!(matches!(feed.take_dirty(|_| Err::<(), _>(Error::msg("full"))), Some(Err(_))));
        assert!(matches!(feed.take_dirty(|b| Ok(b.len())), Some(Ok(1))));
        assert!(feed.take_dirty(|b| Ok(b.len())).is_none());
        assert_eq!(feed.version(), 1);
    }

    #[test]
    fn streaming_thread_never_exposes_partial_lists() {
        let feed = Arc::new(ObjectDataFeed::new(1));
        let tx = feed.sender();

        let producer = thread::spawn(move || {
            for n in 1..=200u32 {
                // Every chunk in snapshot n carries instance count n.
                let chunks = (0..n as i32).map(|x| chunk(x, n)).collect();
                tx.publish(ChunkSnapshot {
                    chunks,
                    player_position: Vec3::ZERO,
                })
                .unwrap();
            }
        });

        let consumer = {
            let feed = Arc::clone(&feed);
            thread::spawn(move || {
                for _ in 0..500 {
                    feed.poll();
                    let bounds = feed.bounds();
                    if let Some(first) = bounds.first() {
                        assert_eq!(bounds.len() as u32, first.instance_count);
                        assert!(bounds.iter().all(|b| b.instance_count == first.instance_count));
                    }
                    thread::yield_now();
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        feed.poll();
        assert_eq!(feed.object_count(), 200);
    }

    #[test]
    fn publish_fails_once_the_feed_is_dropped() {
        let feed = ObjectDataFeed::new(1);
        let tx = feed.sender();
        let other = tx.clone();
        tx.publish(ChunkSnapshot::default()).unwrap();
        assert!(!other.is_closed());

        drop(feed);
        assert!(tx.is_closed());
        let err = other.publish(ChunkSnapshot::default()).unwrap_err();
        assert_eq!(err.to_string(), "object data feed closed");
    }

    #[test]
    fn bounds_keep_their_exact_bits() {
        let feed = ObjectDataFeed::default();
        let odd = ChunkBounds {
            id: ChunkId::new(0, 0, 0),
            min: Vec3::new(0.1, -3.25, f32::MIN_POSITIVE),
            max: Vec3::new(1e6, 7.000_001, 9.125),
            instance_count: 7,
        };
        feed.apply(ChunkSnapshot {
            chunks: vec![odd],
            player_position: Vec3::ZERO,
        });
        let uploaded = feed
            .take_dirty(|list| Ok(bytemuck::cast_slice::<ObjectBound, u8>(list).to_vec()))
            .unwrap()
            .unwrap();
        let expected = ObjectBound::new(odd.min, odd.max, 7);
        assert_eq!(uploaded, bytemuck::bytes_of(&expected));
        assert_eq!(feed.bounds()[0].min().to_array().map(f32::to_bits), odd.min.to_array().map(f32::to_bits));
    }
}
