//! Server-side sequence authority.
//!
//! One counter per server group. Each group owns a disjoint segment of the
//! id space (`group << GROUP_SHIFT`), so ids granted by different groups
//! never collide. A counter advances with a compare-and-swap; before it may
//! pass its persisted ceiling, a new ceiling `end + reserve_ahead` is written
//! through the [`SequenceStore`]. After a restart the counter resumes at the
//! persisted ceiling, so ranges granted before the restart are never granted
//! again.

use super::BatchRange;
use crate::core::context::NodeContext;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::model::node::{GroupId, NodeId};
use crate::ops::metrics::names;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bits reserved for the per-group counter.
pub const GROUP_SHIFT: u32 = 48;

const GROUP_SPAN: u64 = 1 << GROUP_SHIFT;

/// Durable storage for per-group ceilings.
pub trait SequenceStore: Send + Sync {
    /// Persisted ceiling for `group`, if any.
    fn load(&self, group: GroupId) -> Result<Option<u64>>;

    /// Persist a new ceiling for `group`.
    fn store(&self, group: GroupId, ceiling: u64) -> Result<()>;
}

/// In-memory store, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    ceilings: Mutex<HashMap<GroupId, u64>>,
}

impl MemorySequenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceStore for MemorySequenceStore {
    fn load(&self, group: GroupId) -> Result<Option<u64>> {
        Ok(self.ceilings.lock().get(&group).copied())
    }

    fn store(&self, group: GroupId, ceiling: u64) -> Result<()> {
        self.ceilings.lock().insert(group, ceiling);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CeilingRecord {
    group: u32,
    ceiling: u64,
}

/// One file per group under a directory, replaced atomically on write.
#[derive(Debug)]
pub struct FileSequenceStore {
    dir: PathBuf,
}

impl FileSequenceStore {
    /// Open (and create) the store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context("failed to create sequence store directory")?;
        Ok(Self { dir })
    }

    fn path_for(&self, group: GroupId) -> PathBuf {
        self.dir.join(format!("group-{:05}.seq", group.0))
    }
}

impl SequenceStore for FileSequenceStore {
    fn load(&self, group: GroupId) -> Result<Option<u64>> {
        let path = self.path_for(group);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open sequence file {}", path.display()))
            }
        };
        let mut bytes = Vec::new();
        BufReader::new(file)
            .read_to_end(&mut bytes)
            .context("failed to read sequence file")?;
        let record: CeilingRecord =
            bincode::deserialize(&bytes).context("failed to decode sequence file")?;
        if record.group != group.0 {
            anyhow::bail!(
                "sequence file {} belongs to group {}",
                path.display(),
                record.group
            );
        }
        Ok(Some(record.ceiling))
    }

    fn store(&self, group: GroupId, ceiling: u64) -> Result<()> {
        let path = self.path_for(group);
        let tmp = path.with_extension("tmp");
        let bytes = bincode::serialize(&CeilingRecord {
            group: group.0,
            ceiling,
        })
        .context("failed to encode sequence record")?;
        {
            let file = std::fs::File::create(&tmp).context("failed to create sequence file")?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&bytes).context("failed to write sequence file")?;
            writer.flush().context("failed to flush sequence file")?;
            writer
                .get_ref()
                .sync_all()
                .context("failed to sync sequence file")?;
        }
        std::fs::rename(&tmp, &path).context("failed to replace sequence file")?;
        Ok(())
    }
}

#[derive(Debug)]
struct GroupCounter {
    group: GroupId,
    next: AtomicU64,
    ceiling: AtomicU64,
    persist: Mutex<()>,
}

/// Per-group monotonic counters.
pub struct SequenceAuthority {
    ctx: NodeContext,
    groups: Vec<GroupCounter>,
    store: Arc<dyn SequenceStore>,
    reserve_ahead: u64,
}

impl SequenceAuthority {
    /// Open counters for `group_count` groups, resuming from persisted
    /// ceilings.
    pub fn open(
        ctx: NodeContext,
        group_count: u32,
        store: Arc<dyn SequenceStore>,
        reserve_ahead: u64,
    ) -> Result<Self> {
        if group_count == 0 {
            anyhow::bail!("sequence authority needs at least one group");
        }
        let mut groups = Vec::with_capacity(group_count as usize);
        for index in 0..group_count {
            let group = GroupId(index);
            let resume = store
                .load(group)
                .with_context(|| format!("failed to load ceiling for group {}", index))?
                .unwrap_or(0);
            tracing::debug!(group = index, resume, "sequence group opened");
            groups.push(GroupCounter {
                group,
                next: AtomicU64::new(resume),
                ceiling: AtomicU64::new(resume),
                persist: Mutex::new(()),
            });
        }
        Ok(Self {
            ctx,
            groups,
            store,
            reserve_ahead: reserve_ahead.max(1),
        })
    }

    /// Authority backed by a memory store.
    pub fn in_memory(ctx: NodeContext, group_count: u32) -> Result<Self> {
        Self::open(ctx, group_count, Arc::new(MemorySequenceStore::new()), 100_000)
    }

    /// Number of groups.
    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// First id the next grant from `group` will hand out.
    pub fn current(&self, group: GroupId) -> Option<u64> {
        self.groups
            .get(group.0 as usize)
            .map(|c| segment_base(c.group) + c.next.load(Ordering::Acquire))
    }

    /// Atomically advance `group` by `size`, returning `[old, old + size)`
    /// in global id space.
    pub fn request_batch(
        &self,
        receiver: NodeId,
        group: GroupId,
        size: u64,
    ) -> CoherenceResult<BatchRange> {
        let counter = self.groups.get(group.0 as usize).ok_or_else(|| {
            CoherenceError::protocol(receiver, format!("unknown sequence group {}", group.0))
        })?;
        if size == 0 {
            return Ok(BatchRange::EMPTY);
        }
        loop {
            let start = counter.next.load(Ordering::Acquire);
            let end = start
                .checked_add(size)
                .filter(|end| *end <= GROUP_SPAN)
                .ok_or_else(|| {
                    CoherenceError::internal(format!("sequence group {} exhausted", group.0))
                })?;
            if end > counter.ceiling.load(Ordering::Acquire) {
                self.raise_ceiling(counter, end)?;
            }
            if counter
                .next
                .compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let base = segment_base(group);
                let range = BatchRange::new(base + start, base + end);
                self.ctx.metrics().counter_inc(names::SEQUENCE_BATCHES);
                self.ctx.metrics().counter_add(names::SEQUENCE_IDS, size);
                tracing::trace!(node = %receiver, group = group.0, %range, "granted id batch");
                return Ok(range);
            }
        }
    }

    fn raise_ceiling(&self, counter: &GroupCounter, needed: u64) -> CoherenceResult<()> {
        let _guard = counter.persist.lock();
        if needed <= counter.ceiling.load(Ordering::Acquire) {
            return Ok(());
        }
        let ceiling = needed.saturating_add(self.reserve_ahead).min(GROUP_SPAN);
        self.store.store(counter.group, ceiling).map_err(|e| {
            CoherenceError::internal(format!(
                "failed to persist ceiling for group {}: {:#}",
                counter.group.0, e
            ))
        })?;
        counter.ceiling.store(ceiling, Ordering::Release);
        tracing::debug!(group = counter.group.0, ceiling, "sequence ceiling raised");
        Ok(())
    }
}

fn segment_base(group: GroupId) -> u64 {
    (group.0 as u64) << GROUP_SHIFT
}

impl std::fmt::Debug for SequenceAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAuthority")
            .field("groups", &self.groups)
            .field("reserve_ahead", &self.reserve_ahead)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> NodeContext {
        NodeContext::manual("seq").0
    }

    #[test]
    fn test_batches_are_contiguous() {
        let auth = SequenceAuthority::in_memory(ctx(), 1).unwrap();
        let c = NodeId::client(1);
        let a = auth.request_batch(c, GroupId(0), 10).unwrap();
        let b = auth.request_batch(c, GroupId(0), 5).unwrap();
        assert_eq!(a, BatchRange::new(0, 10));
        assert_eq!(b, BatchRange::new(10, 15));
        assert_eq!(auth.current(GroupId(0)), Some(15));
    }

    #[test]
    fn test_groups_use_disjoint_segments() {
        let auth = SequenceAuthority::in_memory(ctx(), 2).unwrap();
        let c = NodeId::client(1);
        let a = auth.request_batch(c, GroupId(0), 10).unwrap();
        let b = auth.request_batch(c, GroupId(1), 10).unwrap();
        assert!(!a.overlaps(&b));
        assert_eq!(b.start, 1 << GROUP_SHIFT);
    }

    #[test]
    fn test_unknown_group_is_protocol_violation() {
        let auth = SequenceAuthority::in_memory(ctx(), 1).unwrap();
        let err = auth
            .request_batch(NodeId::client(1), GroupId(3), 10)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_restart_resumes_past_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let c = NodeId::client(1);
        let first = {
            let store = Arc::new(FileSequenceStore::open(dir.path()).unwrap());
            let auth = SequenceAuthority::open(ctx(), 1, store, 100).unwrap();
            auth.request_batch(c, GroupId(0), 30).unwrap()
        };
        let store = Arc::new(FileSequenceStore::open(dir.path()).unwrap());
        let auth = SequenceAuthority::open(ctx(), 1, store, 100).unwrap();
        let second = auth.request_batch(c, GroupId(0), 30).unwrap();
        assert!(!first.overlaps(&second));
        assert_eq!(second.start, 130);
    }

    #[test]
    fn test_concurrent_grants_are_disjoint() {
        let auth = Arc::new(SequenceAuthority::in_memory(ctx(), 1).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let auth = auth.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            auth.request_batch(NodeId::client(t), GroupId(0), 7)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<BatchRange> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        for pair in all.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(all.len(), 400);
    }
}
