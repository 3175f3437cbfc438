//! Operation generators.
use clap::ValueEnum;
use keel_dispatch_core::{Operation, PartitionKey, TransactionalBatch};
use rand::{Rng, SeedableRng, distr::Alphanumeric, rngs::StdRng};
use serde_json::{Value, json};

use crate::helpers::SizeRange;

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum Workload {
    /// Mostly creates and upserts.
    WriteHeavy,
    /// An even mix of reads and writes.
    Mixed,
    /// Mostly point reads of existing items.
    ReadHeavy,
}

/// Percentages of each operation kind, in the order
/// create, upsert, read, patch, replace. Deletes take the rest.
type Mix = [u32; 5];

/// Generates random operations over the items a single client created.
pub struct OperationGenerator {
    client_id: u64,
    rng: StdRng,
    partition_keys: u64,
    payload_size: SizeRange,
    mix: Mix,
    next_id: u64,
    known: Vec<(u64, String)>,
}

impl Workload {
    fn mix(self) -> Mix {
        match self {
            Workload::WriteHeavy => [50, 30, 10, 5, 3],
            Workload::Mixed => [25, 20, 35, 10, 5],
            Workload::ReadHeavy => [10, 10, 70, 5, 3],
        }
    }
}

impl OperationGenerator {
    pub fn new(
        client_id: u64,
        seed: u64,
        partition_keys: u64,
        payload_size: SizeRange,
        workload: Workload,
    ) -> Self {
        Self {
            client_id,
            rng: StdRng::seed_from_u64(seed.wrapping_add(client_id)),
            partition_keys: partition_keys.max(1),
            payload_size,
            mix: workload.mix(),
            next_id: 0,
            known: Vec::new(),
        }
    }

    pub fn next_operation(&mut self) -> Operation {
        if self.known.is_empty() {
            return self.create();
        }

        let [create, upsert, read, patch, replace] = self.mix;
        let roll = self.rng.random_range(0..100);

        if roll < create {
            self.create()
        } else if roll < create + upsert {
            let (key, id) = self.pick();
            Operation::upsert(partition_key(key), self.payload(&id))
        } else if roll < create + upsert + read {
            let (key, id) = self.pick();
            Operation::read(partition_key(key), id)
        } else if roll < create + upsert + read + patch {
            let (key, id) = self.pick();
            Operation::patch(
                partition_key(key),
                id,
                json!([{"op": "incr", "path": "/counter", "value": 1}]),
            )
        } else if roll < create + upsert + read + patch + replace {
            let (key, id) = self.pick();
            let payload = self.payload(&id);
            Operation::replace(partition_key(key), id, payload)
        } else {
            let index = self.rng.random_range(0..self.known.len());
            let (key, id) = self.known.swap_remove(index);
            Operation::delete(partition_key(key), id)
        }
    }

    /// A batch creating `size` new items under one partition key.
    pub fn transactional_batch(&mut self, size: usize) -> TransactionalBatch {
        let key = self.rng.random_range(0..self.partition_keys);
        let mut batch = TransactionalBatch::new(partition_key(key));

        for _ in 0..size {
            let id = self.new_id();
            batch = batch.create_item(self.payload(&id));
            self.known.push((key, id));
        }

        batch
    }

    fn create(&mut self) -> Operation {
        let key = self.rng.random_range(0..self.partition_keys);
        let id = self.new_id();
        let payload = self.payload(&id);
        self.known.push((key, id));
        Operation::create(partition_key(key), payload)
    }

    fn pick(&mut self) -> (u64, String) {
        let index = self.rng.random_range(0..self.known.len());
        self.known[index].clone()
    }

    fn new_id(&mut self) -> String {
        let id = format!("client-{}-item-{}", self.client_id, self.next_id);
        self.next_id += 1;
        id
    }

    fn payload(&mut self, id: &str) -> Value {
        let size = self.payload_size.sample(&mut self.rng);
        let data: String = (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(size)
            .map(char::from)
            .collect();

        json!({
            "id": id,
            "client": self.client_id,
            "counter": 0,
            "data": data,
        })
    }
}

fn partition_key(key: u64) -> PartitionKey {
    PartitionKey::from(format!("tenant-{key}"))
}
