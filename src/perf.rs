//! Latency/throughput harness
//!
//! Runs a fixed request template through a client session one round trip at
//! a time. Each sample spans from just before `send` to just after the
//! matching response arrived. Warm-up round trips are not recorded.

use crate::error::{ConfigError, Fault, Result, TransportError};
use crate::protocol::{frame_len, Message, MAX_FIELD_LEN};
use crate::session::Session;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

pub const DEFAULT_ITERATIONS: usize = 1000;
pub const DEFAULT_WARMUP: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PerfConfig {
    pub key_size: usize,
    pub payload_size: usize,
    pub iterations: usize,
    pub warmup: usize,
}

impl PerfConfig {
    pub fn new(key_size: usize, payload_size: usize, iterations: usize) -> Self {
        Self {
            key_size,
            payload_size,
            iterations,
            warmup: DEFAULT_WARMUP,
        }
    }

    /// Check sizes against the field bound and `max_frame`.
    pub fn validate(&self, max_frame: usize) -> std::result::Result<(), ConfigError> {
        for (name, value) in [("key_size", self.key_size), ("payload_size", self.payload_size)] {
            if value > MAX_FIELD_LEN {
                return Err(ConfigError::SizeOutOfRange {
                    name,
                    value: value as i64,
                    max: MAX_FIELD_LEN,
                });
            }
        }
        let len = frame_len(self.key_size, self.payload_size);
        if len > max_frame {
            return Err(ConfigError::FrameTooLarge {
                len,
                max: max_frame,
            });
        }
        if self.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        Ok(())
    }
}

/// Parse a size argument. Rejects non-numeric, negative and oversized values.
pub fn parse_size(name: &'static str, raw: &str) -> std::result::Result<usize, ConfigError> {
    let value: i64 = raw.trim().parse().map_err(|_| ConfigError::InvalidSize {
        name,
        value: raw.to_string(),
    })?;
    if value < 0 || value as u64 > MAX_FIELD_LEN as u64 {
        return Err(ConfigError::SizeOutOfRange {
            name,
            value,
            max: MAX_FIELD_LEN,
        });
    }
    Ok(value as usize)
}

/// Key byte `i` is `b'a' + i % 26`.
pub fn key_pattern(len: usize) -> Bytes {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

/// Payload byte `i` is `b'0' + i % 10`.
pub fn payload_pattern(len: usize) -> Bytes {
    (0..len).map(|i| b'0' + (i % 10) as u8).collect()
}

/// Samples and totals of one harness run.
#[derive(Clone, Debug, Serialize)]
pub struct PerfResult {
    pub key_size: usize,
    pub payload_size: usize,
    pub operation_count: usize,
    pub total_elapsed: Duration,
    /// In completion order
    pub samples: Vec<Duration>,
}

impl PerfResult {
    pub fn throughput(&self) -> f64 {
        let secs = self.total_elapsed.as_secs_f64();
        if secs > 0.0 {
            self.operation_count as f64 / secs
        } else {
            0.0
        }
    }

    pub fn mean(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    /// Nearest-rank percentile, `p` in `0..=100`.
    pub fn percentile(&self, p: f64) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.samples.clone();
        sorted.sort();
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn report(&self) -> PerfReport {
        PerfReport {
            key_size: self.key_size,
            payload_size: self.payload_size,
            operations: self.operation_count,
            elapsed_secs: self.total_elapsed.as_secs_f64(),
            ops_per_sec: self.throughput(),
            mean_us: micros(self.mean()),
            p50_us: micros(self.p50()),
            p99_us: micros(self.p99()),
            max_us: micros(self.max()),
        }
    }
}

fn micros(d: Duration) -> f64 {
    d.as_secs_f64() * 1e6
}

/// Summary printed at the end of a run
#[derive(Clone, Debug, Serialize)]
pub struct PerfReport {
    pub key_size: usize,
    pub payload_size: usize,
    pub operations: usize,
    pub elapsed_secs: f64,
    pub ops_per_sec: f64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
}

impl fmt::Display for PerfReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} operations (key {} B, payload {} B) in {:.3}s",
            self.operations, self.key_size, self.payload_size, self.elapsed_secs
        )?;
        writeln!(f, "Throughput: {:.0} ops/sec", self.ops_per_sec)?;
        writeln!(f, "Latency statistics (microseconds):")?;
        writeln!(f, "  Mean:   {:10.2} µs", self.mean_us)?;
        writeln!(f, "  P50:    {:10.2} µs", self.p50_us)?;
        writeln!(f, "  P99:    {:10.2} µs", self.p99_us)?;
        write!(f, "  Max:    {:10.2} µs", self.max_us)
    }
}

pub struct PerfHarness;

impl PerfHarness {
    pub async fn run(session: &mut Session, config: &PerfConfig) -> Result<PerfResult> {
        config.validate(session.max_message_len())?;

        let request = Message::request(key_pattern(config.key_size), payload_pattern(config.payload_size));

        tracing::info!(
            "Perf run over {}: {} warm-up + {} measured round trips, key {} B, payload {} B",
            session.kind(),
            config.warmup,
            config.iterations,
            config.key_size,
            config.payload_size
        );

        for _ in 0..config.warmup {
            let reply = session.request(&request).await?;
            verify_echo(&request, &reply)?;
        }

        let mut samples = Vec::with_capacity(config.iterations);
        let start = Instant::now();
        for _ in 0..config.iterations {
            let sent_at = Instant::now();
            let reply = session.request(&request).await?;
            samples.push(sent_at.elapsed());
            verify_echo(&request, &reply)?;
        }
        let total_elapsed = start.elapsed();

        Ok(PerfResult {
            key_size: config.key_size,
            payload_size: config.payload_size,
            operation_count: samples.len(),
            total_elapsed,
            samples,
        })
    }
}

fn verify_echo(request: &Message, reply: &Message) -> Result<()> {
    if reply.key() != request.key() || reply.payload() != request.payload() {
        return Err(TransportError::Receive(Fault::Malformed(format!(
            "echo mismatch: sent {}+{} bytes, got {}+{} bytes",
            request.key().len(),
            request.payload().len(),
            reply.key().len(),
            reply.payload().len()
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(samples_us: &[u64]) -> PerfResult {
        let samples: Vec<_> = samples_us.iter().map(|&us| Duration::from_micros(us)).collect();
        PerfResult {
            key_size: 3,
            payload_size: 10,
            operation_count: samples.len(),
            total_elapsed: samples.iter().sum(),
            samples,
        }
    }

    #[test]
    fn test_patterns() {
        assert_eq!(&key_pattern(3)[..], b"abc");
        assert_eq!(key_pattern(28)[26..], b"ab"[..]);
        assert_eq!(&payload_pattern(12)[..], b"012345678901");
        assert!(key_pattern(0).is_empty());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("key_size", "3").unwrap(), 3);
        assert_eq!(parse_size("key_size", "0").unwrap(), 0);
        assert!(matches!(
            parse_size("key_size", "three"),
            Err(ConfigError::InvalidSize { .. })
        ));
        assert!(matches!(
            parse_size("payload_size", "-1"),
            Err(ConfigError::SizeOutOfRange { value: -1, .. })
        ));
        let too_big = (MAX_FIELD_LEN + 1).to_string();
        assert!(parse_size("payload_size", &too_big).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(PerfConfig::new(3, 10, 100).validate(usize::MAX).is_ok());
        assert_eq!(
            PerfConfig::new(3, 10, 0).validate(usize::MAX),
            Err(ConfigError::ZeroIterations)
        );
        assert_eq!(
            PerfConfig::new(3, 10, 1).validate(16),
            Err(ConfigError::FrameTooLarge { len: 22, max: 16 })
        );
    }

    #[test]
    fn test_nearest_rank_statistics() {
        let samples: Vec<u64> = (1..=100).collect();
        let r = result(&samples);
        assert_eq!(r.p50(), Duration::from_micros(50));
        assert_eq!(r.p99(), Duration::from_micros(99));
        assert_eq!(r.max(), Duration::from_micros(100));
        assert_eq!(r.mean(), Duration::from_nanos(50_500));
        assert!(r.throughput() > 0.0);

        let single = result(&[7]);
        assert_eq!(single.p50(), Duration::from_micros(7));
        assert_eq!(single.p99(), Duration::from_micros(7));
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(result(&[1, 2, 3]).report()).unwrap();
        assert_eq!(json["operations"], 3);
        assert_eq!(json["key_size"], 3);
    }
}
