//! Property-based checks across randomized operation sequences: tag-index
//! consistency with the live entry set, and the memory engine's capacity
//! bounds.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use cachestack::metadata::MetadataPatch;
use cachestack::provider::memory::{MemoryProvider, MemoryProviderConfig};
use cachestack::provider::traits::{StorageProvider, WriteOptions};
use cachestack::{CacheKey, MetadataIndex, SharedClock, VirtualClock};

#[derive(Debug, Clone)]
enum MetaOp {
    Create { key: u8, tag: u8 },
    Retag { key: u8, tag: u8 },
    Delete { key: u8 },
}

fn meta_op() -> impl Strategy<Value = MetaOp> {
    prop_oneof![
        (0u8..6, 0u8..3).prop_map(|(key, tag)| MetaOp::Create { key, tag }),
        (0u8..6, 0u8..3).prop_map(|(key, tag)| MetaOp::Retag { key, tag }),
        (0u8..6).prop_map(|key| MetaOp::Delete { key }),
    ]
}

fn key_of(n: u8) -> CacheKey {
    CacheKey::new(format!("k{n}")).unwrap()
}

fn tag_of(n: u8) -> Arc<str> {
    Arc::from(format!("t{n}").as_str())
}

proptest! {
    /// After any sequence of create/retag/delete operations, every key the
    /// tag index claims carries a tag must still exist in the metadata
    /// index and must actually carry that tag (and vice versa).
    #[test]
    fn tag_index_matches_live_entries(ops in proptest::collection::vec(meta_op(), 0..200)) {
        let clock: SharedClock = Arc::new(VirtualClock::new(0));
        let idx = MetadataIndex::new(clock);
        let mut live: std::collections::HashMap<u8, u8> = std::collections::HashMap::new();

        for op in ops {
            match op {
                MetaOp::Create { key, tag } => {
                    let k = key_of(key);
                    let tags: HashSet<Arc<str>> = [tag_of(tag)].into();
                    if idx.get(&k).is_some() {
                        idx.update(&k, MetadataPatch { tags: Some(tags), ..Default::default() }).unwrap();
                    } else {
                        idx.create(k, tags, None, 0, false).unwrap();
                    }
                    live.insert(key, tag);
                }
                MetaOp::Retag { key, tag } => {
                    let k = key_of(key);
                    if idx.get(&k).is_some() {
                        let tags: HashSet<Arc<str>> = [tag_of(tag)].into();
                        idx.update(&k, MetadataPatch { tags: Some(tags), ..Default::default() }).unwrap();
                        live.insert(key, tag);
                    }
                }
                MetaOp::Delete { key } => {
                    idx.delete(&key_of(key));
                    live.remove(&key);
                }
            }
        }

        for tag_id in 0u8..3 {
            let tag = tag_of(tag_id);
            let indexed: HashSet<u8> = idx
                .find_by_tag(&tag)
                .into_iter()
                .map(|k| k.as_str()[1..].parse::<u8>().unwrap())
                .collect();
            let expected: HashSet<u8> = live
                .iter()
                .filter(|(_, t)| **t == tag_id)
                .map(|(k, _)| *k)
                .collect();
            prop_assert_eq!(indexed, expected);
        }
    }
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set { key: u8 },
    Delete { key: u8 },
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0u8..10).prop_map(|key| CacheOp::Set { key }),
        (0u8..10).prop_map(|key| CacheOp::Delete { key }),
    ]
}

proptest! {
    /// After any sequence of sets/deletes, the memory provider never holds
    /// more entries than `max_items`, regardless of insertion order.
    #[test]
    fn memory_provider_never_exceeds_max_items(ops in proptest::collection::vec(cache_op(), 0..300)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let observed_counts: Vec<u64> = rt.block_on(async {
            let clock: SharedClock = Arc::new(VirtualClock::new(0));
            let config = MemoryProviderConfig { max_items: 4, ..Default::default() };
            let provider = MemoryProvider::<i32>::new("memory", config, clock);

            let mut counts = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    CacheOp::Set { key } => {
                        provider.set(&key_of(key), i32::from(key), &WriteOptions::default()).await.unwrap();
                    }
                    CacheOp::Delete { key } => {
                        provider.delete(&key_of(key)).await.unwrap();
                    }
                }
                counts.push(provider.get_stats().await.unwrap().key_count);
            }
            counts
        });

        for count in observed_counts {
            prop_assert!(count <= 4);
        }
    }
}
