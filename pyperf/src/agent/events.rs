use std::mem::size_of;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use aya::maps::{AsyncPerfEventArray, HashMap, MapData};
use aya::util::online_cpus;
use aya::{Ebpf, Pod};
use bytes::BytesMut;
use fnv::FnvHashMap;
use pyperf_common::metrics::{Diagnostic, PyError};
use pyperf_common::python::state::{PidConfig, PyPidData};
use pyperf_common::tracemgmt::PidEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::setup;
use crate::descriptor::Classifier;

const PAGES_PER_CPU: usize = 16;
const CHANNEL_SIZE: usize = 2048;

/// Background tasks draining `PID_EVENTS` and `DIAGNOSTICS`.
pub struct EventTasks {
    readers: Vec<JoinHandle<()>>,
    controller: JoinHandle<()>,
    diagnostics: JoinHandle<FnvHashMap<PyError, u64>>,
}

impl EventTasks {
    /// Waits for the streams to drain after the stop signal, returns the
    /// diagnostic tally.
    pub async fn join(self) -> Result<FnvHashMap<PyError, u64>> {
        join_readers(self.readers).await;
        self.controller.await.context("controller task failed")?;
        self.diagnostics.await.context("diagnostics task failed")
    }
}

/// Returns how many readers died instead of stopping.
async fn join_readers(readers: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for (i, r) in readers.into_iter().enumerate() {
        if let Err(e) = r.await {
            warn!("perf reader {i} failed: {e}");
            failed += 1;
        }
    }
    failed
}

fn open_stream<T: Pod + Send + 'static>(
    array: &mut AsyncPerfEventArray<MapData>,
    tx: mpsc::Sender<T>,
    stop_rx: &watch::Receiver<()>,
    ts: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    let cpus = online_cpus().map_err(|(msg, e)| anyhow!("{msg}: {e}"))?;
    for cpu_id in cpus {
        let mut buf = array.open(cpu_id, Some(PAGES_PER_CPU))?;
        let tx = tx.clone();
        let mut stop_rx = stop_rx.clone();
        ts.push(tokio::spawn(async move {
            let mut buffers = (0..16)
                .map(|_| BytesMut::with_capacity(size_of::<T>()))
                .collect::<Vec<_>>();
            loop {
                tokio::select! {
                    evts = buf.read_events(&mut buffers) => {
                        let events = match evts {
                            Ok(events) => events,
                            Err(e) => {
                                warn!("perf buffer on cpu {cpu_id}: {e}");
                                break;
                            }
                        };
                        if events.lost > 0 {
                            warn!("lost {} events on cpu {cpu_id}", events.lost);
                        }
                        for buf in buffers.iter_mut().take(events.read) {
                            if buf.len() < size_of::<T>() {
                                continue;
                            }
                            let v: T = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) };
                            if tx.try_send(v).is_err() {
                                warn!("event consumer is falling behind");
                            }
                        }
                    },
                    _ = stop_rx.changed() => break,
                }
            }
        }));
    }
    Ok(())
}

/// Takes the event streams and the pid maps out of `bpf` and starts the
/// controller: every classification request is answered from `classifier`.
pub fn spawn(
    bpf: &mut Ebpf,
    classifier: Arc<Classifier>,
    stop_rx: watch::Receiver<()>,
) -> Result<EventTasks> {
    let mut pids: HashMap<MapData, u32, PidConfig> =
        HashMap::try_from(bpf.take_map("PIDS").context("no PIDS map")?)?;
    let mut descriptors: HashMap<MapData, u32, PyPidData> =
        HashMap::try_from(bpf.take_map("PY_PID_CONFIG").context("no PY_PID_CONFIG map")?)?;
    setup::seed(&mut pids, &mut descriptors, &classifier)?;

    let mut pid_events =
        AsyncPerfEventArray::try_from(bpf.take_map("PID_EVENTS").context("no PID_EVENTS map")?)?;
    let mut diagnostics =
        AsyncPerfEventArray::try_from(bpf.take_map("DIAGNOSTICS").context("no DIAGNOSTICS map")?)?;

    let mut readers = vec![];
    let (event_tx, mut event_rx) = mpsc::channel::<PidEvent>(CHANNEL_SIZE);
    open_stream(&mut pid_events, event_tx, &stop_rx, &mut readers)?;
    let (diag_tx, mut diag_rx) = mpsc::channel::<Diagnostic>(CHANNEL_SIZE);
    open_stream(&mut diagnostics, diag_tx, &stop_rx, &mut readers)?;

    let controller = tokio::spawn(async move {
        // keep the streams open as long as the readers run
        let _streams = (pid_events, diagnostics);
        while let Some(event) = event_rx.recv().await {
            let Some(classification) = classifier.classify(&event) else {
                warn!("unknown pid event {event:?}");
                continue;
            };
            if let Err(e) = setup::apply(&mut pids, &mut descriptors, event.pid, classification) {
                warn!("pid {}: {e:#}", event.pid);
            }
        }
    });

    let diagnostics = tokio::spawn(async move {
        let mut tally = FnvHashMap::default();
        while let Some(diag) = diag_rx.recv().await {
            match diag.error() {
                Some(code) => {
                    debug!("pid {}: {:?} at {:#x}", diag.pid, code, diag.addr);
                    *tally.entry(code).or_default() += 1;
                }
                None => warn!("unknown diagnostic {diag:?}"),
            }
        }
        tally
    });

    Ok(EventTasks { readers, controller, diagnostics })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_readers_are_counted() {
        let readers = vec![
            tokio::spawn(async {}),
            tokio::spawn(async { panic!("perf buffer gone") }),
            tokio::spawn(async {}),
        ];
        assert_eq!(join_readers(readers).await, 1);
    }
}
