use std::io;
use std::thread::available_parallelism;

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal, Zipf};

const EXTENSIONS: [&str; 4] = [".txt", ".png", ".pdf", ""];

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    seed: u64,

    p50_size: u64,
    p99_size: u64,

    write_weight: u8,
    read_weight: u8,
    open_weight: u8,
    delete_weight: u8,
}

impl WorkloadBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    pub fn action_weights(mut self, writes: u8, reads: u8, opens: u8, deletes: u8) -> Self {
        self.write_weight = writes;
        self.read_weight = reads;
        self.open_weight = opens;
        self.delete_weight = deletes;
        self
    }

    pub fn build(self) -> anyhow::Result<Workload> {
        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let action_distribution = WeightedIndex::new([
            self.write_weight,
            self.read_weight,
            self.open_weight,
            self.delete_weight,
        ])?;

        Ok(Workload {
            name: self.name,
            concurrency: self.concurrency,
            p50_size: self.p50_size,
            p99_size: self.p99_size,

            rng,
            size_distribution,
            action_distribution,

            existing_files: Default::default(),
        })
    }
}

pub struct Workload {
    pub name: &'static str,
    pub concurrency: usize,
    pub p50_size: u64,
    pub p99_size: u64,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates payload sizes for uploads.
    size_distribution: LogNormal<f64>,
    /// Picks between upload, read, open and delete.
    action_distribution: WeightedIndex<u8>,

    /// Uploaded blobs that can be read back or deleted.
    existing_files: Vec<(InternalId, ExternalId)>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: available_parallelism().map_or(4, |n| n.get()),
            seed: rand::random(),

            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,

            write_weight: 25,
            read_weight: 25,
            open_weight: 25,
            delete_weight: 25,
        }
    }

    /// Payloads are derived from their seed, so reads can be verified
    /// without keeping the written bytes around.
    pub fn get_payload(&self, seed: u64) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed);
        let len = self.size_distribution.sample(&mut rng) as u64;

        Payload { len, rng }
    }

    fn sample_readback(&mut self) -> Option<(InternalId, ExternalId)> {
        if self.existing_files.is_empty() {
            return None;
        }
        let len = self.existing_files.len();
        let zipf = Zipf::new(len as f64, 2.0).ok()?;
        let idx = len - self.rng.sample(zipf) as usize;

        Some(self.existing_files.swap_remove(idx))
    }

    pub fn next_action(&mut self) -> Action {
        loop {
            match self.action_distribution.sample(&mut self.rng) {
                0 => {
                    let seed = self.rng.next_u64();
                    let payload = self.get_payload(seed);
                    let filename = format!("upload-{seed:x}{}", EXTENSIONS[seed as usize % 4]);
                    return Action::Upload(InternalId(seed), filename, payload);
                }
                kind @ (1 | 2) => {
                    let Some((internal, external)) = self.sample_readback() else {
                        continue;
                    };
                    let payload = self.get_payload(internal.0);
                    return if kind == 1 {
                        Action::Read(internal, external, payload)
                    } else {
                        Action::Open(internal, external, payload)
                    };
                }
                _ => {
                    let Some((_internal, external)) = self.sample_readback() else {
                        continue;
                    };
                    return Action::Delete(external);
                }
            }
        }
    }

    /// Makes a blob available to later reads and deletes.
    ///
    /// Blobs taken by an action are only pushed back once it completed, so a
    /// blob is never deleted while it is being read.
    pub fn push_file(&mut self, internal: InternalId, external: ExternalId) {
        self.existing_files.push((internal, external))
    }

    /// Identifiers of all blobs still alive, e.g. for a final cleanup.
    pub fn existing_ids(&self) -> Vec<ExternalId> {
        self.existing_files
            .iter()
            .map(|(_internal, external)| external.clone())
            .collect()
    }
}

#[derive(Debug, Eq, Hash, PartialEq)]
pub struct InternalId(pub u64);

pub type ExternalId = String;

pub enum Action {
    Upload(InternalId, String, Payload),
    Read(InternalId, ExternalId, Payload),
    Open(InternalId, ExternalId, Payload),
    Delete(ExternalId),
}

/// Deterministic pseudo-random upload contents.
pub struct Payload {
    pub len: u64,
    pub rng: SmallRng,
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn payloads_are_reproducible() {
        let workload = Workload::builder("test")
            .seed(7)
            .size_distribution(100, 1000)
            .build()
            .unwrap();

        let mut a = vec![];
        let mut b = vec![];
        workload.get_payload(42).read_to_end(&mut a).unwrap();
        workload.get_payload(42).read_to_end(&mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len() as u64, workload.get_payload(42).len);
    }

    #[test]
    fn same_seed_replays_uploads() {
        let filenames = |seed| {
            let mut workload = Workload::builder("test")
                .seed(seed)
                .action_weights(1, 0, 0, 0)
                .build()
                .unwrap();
            (0..10)
                .map(|_| match workload.next_action() {
                    Action::Upload(_, filename, payload) => (filename, payload.len),
                    _ => unreachable!("only uploads are weighted"),
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(filenames(3), filenames(3));
        assert_ne!(filenames(3), filenames(4));
    }

    #[test]
    fn readback_needs_existing_files() {
        let mut workload = Workload::builder("test")
            .seed(1)
            .action_weights(1, 1, 1, 1)
            .build()
            .unwrap();

        for _ in 0..50 {
            match workload.next_action() {
                Action::Upload(internal, filename, _payload) => {
                    workload.push_file(internal, filename);
                }
                Action::Read(_, external, _) | Action::Open(_, external, _) => {
                    assert!(external.starts_with("upload-"));
                }
                Action::Delete(external) => assert!(external.starts_with("upload-")),
            }
        }
    }
}
