//! Minimal producer: writes a handful of counters to the text backend every
//! second, the way a small collector would use this crate directly without
//! going through `tsk-proxy`.

use libtimeseries::backend::ascii::AsciiBackend;
use libtimeseries::{BackendId, Kp, KpMode, Registry};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut registry = Registry::new();
    registry.register(Box::new(AsciiBackend::new()));
    registry.enable_backend(BackendId::Ascii, "-f demo.tsk")?;
    let registry = Rc::new(RefCell::new(registry));

    let mut kp = Kp::create(registry, KpMode::ResetOnFlush);
    let requests = kp.add_key("demo.requests");
    let errors = kp.add_key("demo.errors");

    for tick in 0..5u64 {
        kp.set(requests, 100 + tick)?;
        kp.set(errors, tick % 3)?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as u32;
        kp.flush(now)?;
        std::thread::sleep(std::time::Duration::from_secs(1));
    }

    Ok(())
}
