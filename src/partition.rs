//! Static assignment of files to the workers of a fixed-size pool.
//!
//! Workers never talk to each other, so the assignment has to be a pure
//! function of the file id and the pool size: every worker hashes the decimal
//! representation of the file id with the same seed and reduces the signed
//! hash modulo the worker count.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

const HASH_SEED: u64 = 0;

/// Invalid worker partition descriptor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    /// A pool needs at least one worker
    #[error("Invalid worker data: worker count must be at least 1")]
    EmptyPool,
    /// The index is outside of the pool
    #[error("Invalid worker data: worker index {index} is out of range for {count} workers")]
    IndexOutOfRange {
        /// Given index
        index: u32,
        /// Given pool size
        count: u32,
    },
    /// The serialized descriptor could not be parsed
    #[error("Invalid worker data: {0}")]
    Malformed(String),
}

/// Modulo that always returns a remainder in `[0, |n|)`. Yields `0` for `n == 0`.
pub fn abs_mod(x: i64, n: i64) -> i64 {
    if n == 0 {
        return 0;
    }
    // |i64::MIN| only fits in i128, the remainder is below it and fits i64 again
    let r = i128::from(x).rem_euclid(i128::from(n).abs());
    i64::try_from(r).unwrap_or_default()
}

fn file_hash(file_id: i64) -> i64 {
    xxh64(file_id.to_string().as_bytes(), HASH_SEED) as i64
}

/// Index of the worker responsible for `file_id` in a pool of `worker_count`.
pub fn assign(file_id: i64, worker_count: u32) -> u32 {
    let count = i64::from(worker_count.max(1));
    // abs_mod keeps the result in [0, count) which fits u32
    abs_mod(file_hash(file_id), count) as u32
}

/// Identity of one worker within a pool for one coordinated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPartition", into = "RawPartition")]
pub struct WorkerPartition {
    index: u32,
    count: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPartition {
    worker_index: u32,
    worker_count: u32,
}

impl TryFrom<RawPartition> for WorkerPartition {
    type Error = PartitionError;

    fn try_from(raw: RawPartition) -> Result<Self, Self::Error> {
        Self::new(raw.worker_index, raw.worker_count)
    }
}

impl From<WorkerPartition> for RawPartition {
    fn from(partition: WorkerPartition) -> Self {
        Self {
            worker_index: partition.index,
            worker_count: partition.count,
        }
    }
}

impl WorkerPartition {
    /// Validate and create a partition descriptor.
    pub fn new(index: u32, count: u32) -> Result<Self, PartitionError> {
        if count == 0 {
            return Err(PartitionError::EmptyPool);
        }
        if index >= count {
            return Err(PartitionError::IndexOutOfRange { index, count });
        }
        Ok(Self { index, count })
    }

    /// Parse the `{"workerIndex": i, "workerCount": n}` form handed to workers.
    pub fn from_json(data: &str) -> Result<Self, PartitionError> {
        serde_json::from_str(data).map_err(|e| PartitionError::Malformed(e.to_string()))
    }

    /// Serialize into the form accepted by [`WorkerPartition::from_json`].
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// All partitions of a pool of `count` workers.
    pub fn pool(count: u32) -> Result<Vec<Self>, PartitionError> {
        (0..count.max(1)).map(|index| Self::new(index, count)).collect()
    }

    /// Position of this worker in the pool.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size of the pool.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether this worker is responsible for `file_id`.
    pub fn is_mine(&self, file_id: i64) -> bool {
        assign(file_id, self.count) == self.index
    }
}

impl std::fmt::Display for WorkerPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_mod_is_never_negative() {
        assert_eq!(abs_mod(3, 10), 3);
        assert_eq!(abs_mod(-3, 10), 7);
        assert_eq!(abs_mod(13, 10), 3);
        assert_eq!(abs_mod(-13, 10), 7);
        assert_eq!(abs_mod(i64::MIN, 7), abs_mod(i64::MIN + 7, 7));
    }

    #[test]
    fn abs_mod_degenerate_divisors() {
        assert_eq!(abs_mod(5, 0), 0);
        assert_eq!(abs_mod(-5, -10), 5);
        assert_eq!(abs_mod(-1, i64::MIN), i64::MAX);
        assert_eq!(abs_mod(i64::MIN, i64::MIN), 0);
        assert_eq!(abs_mod(i64::MAX, i64::MIN), i64::MAX);
    }

    #[test]
    fn abs_mod_is_periodic() {
        for n in 1..=9 {
            for x in -50..50 {
                let r = abs_mod(x, n);
                assert!((0..n).contains(&r), "abs_mod({x}, {n}) = {r}");
                assert_eq!(r, abs_mod(x + n, n));
            }
        }
    }

    #[test]
    fn assignment_is_stable_and_in_range() {
        for file_id in [0, 1, 10, 11, 12, 13, 4_294_967_296, i64::MAX] {
            for count in 1..=5 {
                let first = assign(file_id, count);
                assert!(first < count);
                assert_eq!(first, assign(file_id, count));
            }
        }
    }

    #[test]
    fn single_worker_owns_everything() {
        let partition = WorkerPartition::new(0, 1).unwrap();
        assert!((0..100).all(|file_id| partition.is_mine(file_id)));
    }

    #[test]
    fn exactly_one_worker_owns_each_file() {
        let pool = WorkerPartition::pool(3).unwrap();
        for file_id in 0..200 {
            let owners = pool.iter().filter(|p| p.is_mine(file_id)).count();
            assert_eq!(owners, 1, "file {file_id}");
        }
    }

    #[test]
    fn invalid_partitions_are_rejected() {
        assert_eq!(WorkerPartition::new(0, 0), Err(PartitionError::EmptyPool));
        assert_eq!(
            WorkerPartition::new(2, 2),
            Err(PartitionError::IndexOutOfRange { index: 2, count: 2 })
        );
    }

    #[test]
    fn json_descriptor() {
        let partition = WorkerPartition::from_json(r#"{"workerIndex": 1, "workerCount": 4}"#).unwrap();
        assert_eq!(partition, WorkerPartition::new(1, 4).unwrap());
        assert_eq!(partition.to_json(), r#"{"workerIndex":1,"workerCount":4}"#);

        assert!(matches!(
            WorkerPartition::from_json(r#"{"workerIndex": 4, "workerCount": 4}"#),
            Err(PartitionError::Malformed(_))
        ));
        assert!(matches!(
            WorkerPartition::from_json(r#"{"workerIndex": 0}"#),
            Err(PartitionError::Malformed(_))
        ));
    }
}
