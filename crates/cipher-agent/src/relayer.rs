//! Delayed relayer queue.
//!
//! Accepted withdrawals sit in RAM for a CSPRNG-drawn delay before being
//! submitted on-chain under our own account, breaking the timing link
//! between a requester and the withdrawal transaction. Entries survive
//! failures (flat 60 s re-arm) but not process restarts.

use cipher_chain::ChainClient;
use cipher_core::error::Error;
use cipher_core::prover::{signal, Groth16Proof};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{RateLimitConfig, RelayerConfig};

/// Deadline on each on-chain submission.
const SUBMIT_DEADLINE: Duration = Duration::from_secs(30);
/// Flat re-arm interval after a failed submission.
const RETRY_DELAY: Duration = Duration::from_secs(60);
/// Tracked-IP bound before the rate limiter bulk-evicts.
const RATE_LIMIT_MAX_IPS: usize = 1000;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub proof: Groth16Proof,
    pub recipient: String,
    pub amount: u64,
    pub chunk_id: u32,
    pub submitted_at: Instant,
    pub execute_at: Instant,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayerStatus {
    pub queue_length: usize,
    pub processing: bool,
    pub fee: u64,
    pub max_delay: u64,
}

pub struct RelayerService {
    cfg: RelayerConfig,
    chain: Arc<dyn ChainClient>,
    queue: Mutex<Vec<QueueEntry>>,
    wake: Notify,
    processing: AtomicBool,
    limiter: RateLimiter,
}

impl RelayerService {
    pub fn new(cfg: RelayerConfig, chain: Arc<dyn ChainClient>) -> Arc<Self> {
        let limiter = RateLimiter::new(cfg.rate_limit.clone());
        Arc::new(Self {
            cfg,
            chain,
            queue: Mutex::new(Vec::new()),
            wake: Notify::new(),
            processing: AtomicBool::new(false),
            limiter,
        })
    }

    pub fn max_body(&self) -> usize {
        self.cfg.max_body
    }

    /// Sliding-window admission check for one source IP.
    pub fn admit(&self, ip: IpAddr) -> bool {
        self.limiter.admit(ip)
    }

    /// Enqueue a validated withdrawal. Returns the queue ID and the
    /// estimated execution time in milliseconds since the epoch.
    pub fn enqueue(
        &self,
        proof: Groth16Proof,
        recipient: String,
        amount: u64,
        chunk_id: u32,
    ) -> (String, i64) {
        let delay = random_delay(self.cfg.min_delay, self.cfg.max_delay);
        let now = Instant::now();
        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let entry = QueueEntry {
            id: hex::encode(id_bytes),
            proof,
            recipient,
            amount,
            chunk_id,
            submitted_at: now,
            execute_at: now + delay,
        };
        let id = entry.id.clone();
        let estimated =
            chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.queue.lock().expect("queue lock").push(entry);
        self.wake.notify_one();
        info!(queue_id = %id, delay_s = delay.as_secs(), "withdrawal queued");
        (id, estimated)
    }

    pub fn status(&self) -> RelayerStatus {
        RelayerStatus {
            queue_length: self.queue.lock().expect("queue lock").len(),
            processing: self.processing.load(Ordering::Relaxed),
            fee: self.cfg.fee,
            max_delay: self.cfg.max_delay.as_millis() as u64,
        }
    }

    /// Queue processor. One per service; submissions are strictly
    /// sequential in queue-pop order.
    pub async fn run_processor(self: Arc<Self>, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let now = Instant::now();
            let (ready, next_deadline) = {
                let mut queue = self.queue.lock().expect("queue lock");
                let mut ready = Vec::new();
                let mut i = 0;
                while i < queue.len() {
                    if queue[i].execute_at <= now {
                        ready.push(queue.remove(i));
                    } else {
                        i += 1;
                    }
                }
                let next = queue.iter().map(|e| e.execute_at).min();
                (ready, next)
            };

            if ready.is_empty() {
                match next_deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                            _ = self.wake.notified() => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = self.wake.notified() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
                continue;
            }

            self.processing.store(true, Ordering::Relaxed);
            for entry in ready {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                self.process_entry(entry).await;
            }
            self.processing.store(false, Ordering::Relaxed);
        }
    }

    async fn process_entry(&self, entry: QueueEntry) {
        let nullifier_hash = match entry.proof.public_signal(signal::NULLIFIER_HASH) {
            Ok(hash) => hash.to_string(),
            Err(e) => {
                warn!(queue_id = %entry.id, error = %e, "entry dropped: no nullifier hash");
                return;
            }
        };
        match self
            .chain
            .submit_withdraw(
                &entry.proof,
                &entry.recipient,
                entry.chunk_id,
                &nullifier_hash,
                SUBMIT_DEADLINE,
            )
            .await
        {
            Ok(tx_id) => {
                info!(queue_id = %entry.id, tx_id, "relayed withdrawal submitted");
            }
            Err(Error::ChainRejected(reason)) if reason.contains("duplicate") => {
                // a spent nullifier can never succeed; retrying is pointless
                warn!(queue_id = %entry.id, reason, "entry dropped: nullifier already spent");
            }
            Err(e) => {
                warn!(queue_id = %entry.id, error = %e, "submission failed, re-armed");
                let mut rearmed = entry;
                rearmed.execute_at = Instant::now() + RETRY_DELAY;
                self.queue.lock().expect("queue lock").push(rearmed);
                self.wake.notify_one();
            }
        }
    }
}

/// Uniform delay from the OS CSPRNG.
pub fn random_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    Duration::from_millis(OsRng.gen_range(min.as_millis() as u64..=max.as_millis() as u64))
}

struct RateLimiter {
    cfg: RateLimitConfig,
    hits: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn admit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let window = self.cfg.window;
        let mut hits = self.hits.lock().expect("rate-limit lock");

        let entry = hits.entry(ip).or_default();
        entry.retain(|t| now.duration_since(*t) < window);
        if entry.len() >= self.cfg.requests {
            return false;
        }
        entry.push(now);

        if hits.len() > RATE_LIMIT_MAX_IPS {
            hits.retain(|_, stamps| {
                stamps.retain(|t| now.duration_since(*t) < window);
                !stamps.is_empty()
            });
            debug!(tracked = hits.len(), "rate limiter bulk-evicted idle sources");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher_chain::MockChain;

    fn test_cfg(requests: usize, window_ms: u64) -> RelayerConfig {
        RelayerConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            fee: 0,
            rate_limit: RateLimitConfig {
                requests,
                window: Duration::from_millis(window_ms),
            },
            max_body: 1024 * 1024,
        }
    }

    #[test]
    fn rate_limit_boundary() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests: 3,
            window: Duration::from_millis(200),
        });
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        for _ in 0..3 {
            assert!(limiter.admit(ip));
        }
        assert!(!limiter.admit(ip));
        // a different source is unaffected
        assert!(limiter.admit("5.6.7.8".parse().unwrap()));
        std::thread::sleep(Duration::from_millis(220));
        assert!(limiter.admit(ip));
    }

    #[test]
    fn delay_draws_stay_in_bounds_and_look_uniform() {
        let min = Duration::from_millis(0);
        let max = Duration::from_millis(999);
        const DRAWS: usize = 10_000;
        const BINS: usize = 10;
        let mut counts = [0usize; BINS];
        for _ in 0..DRAWS {
            let d = random_delay(min, max);
            assert!(d >= min && d <= max);
            counts[(d.as_millis() as usize * BINS) / 1000] += 1;
        }
        // chi-square against uniform: 9 dof, 1% critical value 21.67
        let expected = (DRAWS / BINS) as f64;
        let chi2: f64 = counts
            .iter()
            .map(|&c| {
                let diff = c as f64 - expected;
                diff * diff / expected
            })
            .sum();
        assert!(chi2 < 21.67, "chi-square {chi2} too high for uniform draws");
    }

    #[test]
    fn degenerate_delay_range() {
        assert_eq!(
            random_delay(Duration::from_secs(5), Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn queue_ids_are_128_bit_and_unique() {
        let service = RelayerService::new(test_cfg(10, 1000), Arc::new(MockChain::new()));
        let proof = Groth16Proof {
            pi_a: vec!["1".into(); 3],
            pi_b: vec![vec!["1".into(); 2]; 3],
            pi_c: vec!["1".into(); 3],
            protocol: "groth16".into(),
            curve: "bn128".into(),
            public_signals: vec![],
        };
        let (a, _) = service.enqueue(proof.clone(), "r".into(), 1, 0);
        let (b, _) = service.enqueue(proof, "r".into(), 1, 0);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(service.status().queue_length, 2);
    }
}
