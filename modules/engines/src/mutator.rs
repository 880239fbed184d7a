//! Byte mutators: an external process (radamsa) fed over stdin/stdout, and a
//! small builtin fallback used when no external mutator is available.

use rand::seq::SliceRandom;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const DANGEROUS_U8: &[u8] = &[0x00, 0xff, 0x7f, 0x80];
const DANGEROUS_U16: &[u16] = &[0x0000, 0xffff, 0x7fff, 0x8000, 0xff7f, 0x0080];
const DANGEROUS_U32: &[u32] = &[0, u32::MAX, i32::MAX as u32, (i32::MAX as u32) + 1, 0xffff_ff7f, 0x0000_0080];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutator {
    External { path: PathBuf, timeout: Duration },
    Builtin,
}

impl Mutator {
    pub fn name(&self) -> &'static str {
        match self {
            Mutator::External { .. } => "external",
            Mutator::Builtin => "builtin",
        }
    }

    pub async fn mutate<R: Rng + Send>(&self, seed: &[u8], rng: &mut R) -> io::Result<Vec<u8>> {
        match self {
            Mutator::External { path, timeout } => run_external(path, seed, *timeout).await,
            Mutator::Builtin => Ok(builtin_mutate(seed, rng)),
        }
    }
}

/// Pipes `input` through `path` and returns its stdout. The child is killed
/// if it outlives `timeout` or the calling future is dropped.
pub async fn run_external(path: &Path, input: &[u8], timeout: Duration) -> io::Result<Vec<u8>> {
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child.stdin.take().ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "mutator stdin"))?;
    let input = input.to_vec();
    let feed = tokio::spawn(async move {
        let res = stdin.write_all(&input).await;
        drop(stdin);
        res
    });
    let out = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "mutator timed out"))??;
    // A mutator may exit without reading all of stdin.
    let _ = feed.await;
    if !out.status.success() {
        return Err(io::Error::new(io::ErrorKind::Other, format!("mutator exited with {}", out.status)));
    }
    Ok(out.stdout)
}

/// One round of byte-level mutation: bit and byte flips, small arithmetic,
/// interesting values, and block insert/delete/duplicate.
pub fn builtin_mutate<R: Rng + ?Sized>(seed: &[u8], rng: &mut R) -> Vec<u8> {
    let mut data = seed.to_vec();
    let rounds = rng.gen_range(1..=4);
    for _ in 0..rounds {
        if data.is_empty() {
            let n = rng.gen_range(1..=16);
            data.extend((0..n).map(|_| rng.gen::<u8>()));
            continue;
        }
        let len = data.len();
        let at = rng.gen_range(0..len);
        match rng.gen_range(0..8) {
            0 => data[at] ^= 1 << rng.gen_range(0..8),
            1 => data[at] ^= 0xff,
            2 => {
                let delta = rng.gen_range(1..=16u8);
                data[at] = if rng.gen() { data[at].wrapping_add(delta) } else { data[at].wrapping_sub(delta) };
            }
            3 => data[at] = *DANGEROUS_U8.choose(rng).unwrap_or(&0),
            4 => {
                let v = DANGEROUS_U16.choose(rng).copied().unwrap_or(0).to_be_bytes();
                overwrite(&mut data, at, &v);
            }
            5 => {
                let v = DANGEROUS_U32.choose(rng).copied().unwrap_or(0).to_be_bytes();
                overwrite(&mut data, at, &v);
            }
            6 => {
                let n = rng.gen_range(1..=len.min(64));
                let block: Vec<u8> = data[at..(at + n).min(len)].to_vec();
                let to = rng.gen_range(0..=len);
                data.splice(to..to, block);
            }
            _ => {
                let n = rng.gen_range(1..=(len - at).min(32));
                data.drain(at..at + n);
            }
        }
    }
    data
}

fn overwrite(data: &mut [u8], at: usize, bytes: &[u8]) {
    for (slot, b) in data[at..].iter_mut().zip(bytes) {
        *slot = *b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn builtin_changes_input() {
        let mut rng = StdRng::seed_from_u64(11);
        let seed = b"GET / HTTP/1.1\r\n\r\n";
        let changed = (0..100).filter(|_| builtin_mutate(seed, &mut rng) != seed).count();
        assert!(changed > 80);
    }

    #[test]
    fn builtin_grows_empty_seed() {
        let mut rng = StdRng::seed_from_u64(5);
        assert!(!builtin_mutate(b"", &mut rng).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_mutator_round_trips_through_cat() {
        let cat = Path::new("/bin/cat");
        if !cat.exists() {
            return;
        }
        let out = run_external(cat, b"seed-bytes", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, b"seed-bytes");
    }

    #[tokio::test]
    async fn missing_external_mutator_errors() {
        let m = Mutator::External { path: PathBuf::from("/nonexistent/radamsa"), timeout: Duration::from_secs(1) };
        let mut rng = StdRng::seed_from_u64(1);
        assert!(m.mutate(b"x", &mut rng).await.is_err());
    }
}
