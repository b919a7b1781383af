//! File-backed implementation of `serf::Snapshotter` (§4.E, §6 "Snapshot
//! file"). The core only calls the trait; actually putting bytes on disk is
//! a collaborator concern per spec.md §1, which is exactly the role this
//! agent crate plays for config and tag/keyring files too.
//!
//! Format: one line per record, append-only, matching §6 verbatim —
//! `alive <name> <addr>`, `not-alive <name>`, `event <ltime>`,
//! `query <ltime>`, `leave`, `coordinate <v0> <v1> ... <height> <error>
//! <adjustment>`. No compaction yet; see `DESIGN.md`.
use parking_lot::Mutex;
use serf::{Coordinate, Snapshotter};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::Path;

pub struct FileSnapshotter {
    file: Mutex<File>,
}

impl FileSnapshotter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    fn write_line(&self, line: &str) {
        let mut f = self.file.lock();
        if let Err(e) = writeln!(f, "{line}") {
            tracing::warn!(error = %e, "snapshot write failed");
        }
    }
}

impl Snapshotter for FileSnapshotter {
    fn record_alive(&self, name: &str, addr: SocketAddr) {
        self.write_line(&format!("alive {name} {addr}"));
    }

    fn record_not_alive(&self, name: &str) {
        self.write_line(&format!("not-alive {name}"));
    }

    fn record_event_clock(&self, ltime: u64) {
        self.write_line(&format!("event {ltime}"));
    }

    fn record_query_clock(&self, ltime: u64) {
        self.write_line(&format!("query {ltime}"));
    }

    fn record_leave(&self) {
        self.write_line("leave");
    }

    fn record_coordinate(&self, coord: &Coordinate) {
        let mut parts = coord.vec.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        parts.push(coord.height.to_string());
        parts.push(coord.error.to_string());
        parts.push(coord.adjustment.to_string());
        self.write_line(&format!("coordinate {}", parts.join(" ")));
    }
}

/// What a restarted agent recovers from a prior snapshot file: the peers
/// known alive last time (to rejoin) and the highest Lamport clocks seen (so
/// `LClock::witness` on startup never accepts a record token that looks
/// fresh only because the clock restarted from zero).
#[derive(Debug, Default, Clone)]
pub struct SnapshotSeed {
    pub rejoin: Vec<SocketAddr>,
    pub event_clock: u64,
    pub query_clock: u64,
    pub coordinate: Option<Coordinate>,
}

/// Replays a snapshot file written by [`FileSnapshotter`]. Missing file is
/// not an error — a fresh node simply seeds nothing.
pub fn read_snapshot(path: &Path) -> io::Result<SnapshotSeed> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SnapshotSeed::default()),
        Err(e) => return Err(e),
    };
    let mut seed = SnapshotSeed::default();
    let mut alive: std::collections::HashMap<String, SocketAddr> = std::collections::HashMap::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("alive") => {
                if let (Some(name), Some(addr)) = (parts.next(), parts.next()) {
                    if let Ok(addr) = addr.parse() {
                        alive.insert(name.to_string(), addr);
                    }
                }
            }
            Some("not-alive") => {
                if let Some(name) = parts.next() {
                    alive.remove(name);
                }
            }
            Some("event") => {
                if let Some(v) = parts.next().and_then(|s| s.parse().ok()) {
                    seed.event_clock = seed.event_clock.max(v);
                }
            }
            Some("query") => {
                if let Some(v) = parts.next().and_then(|s| s.parse().ok()) {
                    seed.query_clock = seed.query_clock.max(v);
                }
            }
            Some("leave") => {
                alive.clear();
            }
            Some("coordinate") => {
                let values: Vec<f64> = parts.filter_map(|s| s.parse().ok()).collect();
                if values.len() == serf::coordinate::DIMENSIONALITY + 3 {
                    let mut vec = [0.0; serf::coordinate::DIMENSIONALITY];
                    vec.copy_from_slice(&values[..serf::coordinate::DIMENSIONALITY]);
                    seed.coordinate = Some(Coordinate {
                        vec,
                        height: values[serf::coordinate::DIMENSIONALITY],
                        error: values[serf::coordinate::DIMENSIONALITY + 1],
                        adjustment: values[serf::coordinate::DIMENSIONALITY + 2],
                    });
                }
            }
            _ => {}
        }
    }
    seed.rejoin = alive.into_values().collect();
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn writes_expected_line_formats() {
        let dir = std::env::temp_dir().join(format!("serf-agent-snapshot-test-{}", std::process::id()));
        let snap = FileSnapshotter::open(&dir).unwrap();
        snap.record_alive("a", "127.0.0.1:7946".parse().unwrap());
        snap.record_event_clock(5);
        snap.record_leave();
        drop(snap);

        let mut contents = String::new();
        File::open(&dir).unwrap().read_to_string(&mut contents).unwrap();
        assert!(contents.contains("alive a 127.0.0.1:7946"));
        assert!(contents.contains("event 5"));
        assert!(contents.contains("leave"));
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn replays_alive_and_not_alive_and_clocks() {
        let dir = std::env::temp_dir().join(format!("serf-agent-snapshot-test-replay-{}", std::process::id()));
        std::fs::write(
            &dir,
            "alive a 127.0.0.1:7946\nalive b 127.0.0.1:7947\nnot-alive b\nevent 3\nquery 9\n",
        )
        .unwrap();
        let seed = read_snapshot(&dir).unwrap();
        assert_eq!(seed.rejoin, vec!["127.0.0.1:7946".parse().unwrap()]);
        assert_eq!(seed.event_clock, 3);
        assert_eq!(seed.query_clock, 9);
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn missing_file_seeds_nothing() {
        let dir = std::env::temp_dir().join("serf-agent-snapshot-test-missing-does-not-exist");
        std::fs::remove_file(&dir).ok();
        let seed = read_snapshot(&dir).unwrap();
        assert!(seed.rejoin.is_empty());
    }
}
