#![allow(dead_code)]
//! Shared helpers for the integration suites.

use std::{
    path::Path,
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use warden::reaper::Reaper;

/// One reaper per test binary. Tests run threaded in a single process and
/// a second reap loop would steal the first one's exits.
pub fn shared_reaper() -> Arc<Reaper> {
    static REAPER: OnceLock<Arc<Reaper>> = OnceLock::new();
    Arc::clone(REAPER.get_or_init(|| {
        let reaper = Reaper::new();
        reaper.start().expect("start shared reaper");
        Arc::new(reaper)
    }))
}

/// Polls `done` until it returns true or the deadline passes.
pub fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Writes one layer file under `<dir>/layers/`.
pub fn write_layer(dir: &Path, name: &str, content: &str) {
    let layers = dir.join("layers");
    std::fs::create_dir_all(&layers).expect("create layers dir");
    std::fs::write(layers.join(name), content).expect("write layer");
}
