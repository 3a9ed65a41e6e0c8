//! Time-bounded discovery of emob advertisers
//!
//! A [`Scanner`] starts a filtered discovery on its [`Central`] and hands
//! out a [`ScanSession`] stream. The session ends when its duration elapses,
//! when the scanner reports a hard failure, or when the consumer stops or
//! drops it. Whatever the exit path, discovery is stopped exactly once and
//! the observable [`ScanState`] leaves `Scanning`.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use emob_core::protocol::EMOB_SERVICE_UUID;
use emob_core::transport::{Central, DiscoveryEvent, DiscoveryEvents};
use emob_core::{EmobError, PeerDevice, Result, ScanState};
use futures::{future, Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scope::BleScope;

/// Buffered discoveries; further sightings are dropped until the consumer reads
const SCAN_RESULT_BUFFER: usize = 32;

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

/// Discovers peers advertising the emob service
pub struct Scanner<C: Central> {
    central: Arc<C>,
    scope: BleScope,
    state: watch::Sender<ScanState>,
}

impl<C: Central> Scanner<C> {
    pub fn new(central: Arc<C>, scope: BleScope) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            central,
            scope,
            state,
        }
    }

    /// Observe the scan state
    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ScanState {
        self.state.borrow().clone()
    }

    /// Start a scan bounded by `duration`
    ///
    /// Each matching advertisement is yielded as `Ok(peer)`; a peer may be
    /// reported more than once, and sightings are dropped while the consumer
    /// lags behind. If the duration elapses the last item is
    /// `Err(DeviceNotFound)`, and a scanner failure ends the stream with
    /// `Err(Scanner { code })`.
    pub async fn scan(&self, duration: Duration) -> Result<ScanSession> {
        let claimed = self.state.send_if_modified(|state| {
            if state.is_scanning() {
                false
            } else {
                *state = ScanState::Scanning;
                true
            }
        });
        if !claimed {
            return Err(EmobError::ScanInProgress);
        }

        let events = match self.central.start_discovery(EMOB_SERVICE_UUID).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to start discovery: {}", e);
                self.state.send_replace(ScanState::Failed(e.clone()));
                return Err(e);
            }
        };
        info!("Scanning for emob peers for {:?}", duration);

        let (tx, rx) = mpsc::channel(SCAN_RESULT_BUFFER);
        let driver = ScanDriver {
            central: self.central.clone(),
            state: self.state.clone(),
            results: tx,
        };
        let task = self
            .scope
            .spawn("emob-scan", driver.run(events, duration));

        Ok(ScanSession {
            results: rx,
            driver: task,
        })
    }
}

// ----------------------------------------------------------------------------
// Scan Driver
// ----------------------------------------------------------------------------

struct ScanDriver<C: Central> {
    central: Arc<C>,
    state: watch::Sender<ScanState>,
    results: mpsc::Sender<Result<PeerDevice>>,
}

impl<C: Central> ScanDriver<C> {
    async fn run(self, mut events: DiscoveryEvents, duration: Duration) -> Result<()> {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Scan window of {:?} elapsed", duration);
                    break Some(EmobError::DeviceNotFound);
                }
                _ = self.results.closed() => {
                    debug!("Scan consumer went away");
                    break None;
                }
                event = events.recv() => match event {
                    Some(DiscoveryEvent::Found(peer)) => {
                        debug!("Discovered {}", peer);
                        match self.results.try_send(Ok(peer)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(Ok(peer))) => {
                                debug!("Scan consumer is behind, dropping sighting of {}", peer);
                            }
                            Err(TrySendError::Full(Err(_))) => {}
                            Err(TrySendError::Closed(_)) => break None,
                        }
                    }
                    Some(DiscoveryEvent::Failed { code }) => {
                        warn!("Scan failed with code {}", code);
                        break Some(EmobError::Scanner { code });
                    }
                    None => break None,
                },
            }
        };

        // Results produced after this point are never delivered
        drop(events);
        self.central.stop_discovery().await;

        match outcome {
            Some(cause) => {
                self.state.send_replace(ScanState::Failed(cause.clone()));
                let _ = self.results.send(Err(cause)).await;
            }
            None => {
                self.state.send_replace(ScanState::Idle);
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Scan Session
// ----------------------------------------------------------------------------

/// Stream of discoveries from one scan
#[derive(Debug)]
pub struct ScanSession {
    results: mpsc::Receiver<Result<PeerDevice>>,
    driver: JoinHandle<()>,
}

impl ScanSession {
    /// End the scan early and wait until discovery has been stopped
    pub async fn stop(mut self) {
        self.results.close();
        let _ = (&mut self.driver).await;
    }

    /// Only yield the first sighting of each address
    pub fn unique_by_address(self) -> impl Stream<Item = Result<PeerDevice>> + Unpin {
        let mut seen = HashSet::new();
        self.filter(move |item| {
            let keep = match item {
                Ok(peer) => seen.insert(peer.address().clone()),
                Err(_) => true,
            };
            future::ready(keep)
        })
    }
}

impl Stream for ScanSession {
    type Item = Result<PeerDevice>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.poll_recv(cx)
    }
}
