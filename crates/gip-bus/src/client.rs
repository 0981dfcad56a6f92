//! Per-client state.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gip_core::audio::AudioConfig;
use gip_core::identify::{AudioFormatPair, IdentifyData};
use gip_core::message::Announce;

use crate::audio::AudioRing;
use crate::chunk::ChunkBuffer;
use crate::driver::Driver;

/// Lifecycle of a client on the bus.
///
/// Announce moves Connected → Announced, an Identify reply moves
/// Announced → Identified, and a Status with the connected bit clear
/// moves any state to Disconnected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifecycle {
    #[default]
    Connected,
    Announced,
    Identified,
    Disconnected,
}

#[derive(Default)]
pub(crate) struct ClientState {
    pub lifecycle: Lifecycle,
    pub announce: Option<Announce>,
    pub identify: Option<IdentifyData>,
    pub audio_in: Option<AudioConfig>,
    pub audio_out: Option<AudioConfig>,
    /// Format pair proposed to the device, awaiting acceptance.
    pub pending_audio: Option<(u8, u8)>,
}

pub(crate) struct AuthHandle {
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    pub task: JoinHandle<()>,
}

/// One logical device behind the adapter, identified by the client nibble
/// of the options byte.
pub struct Client {
    id: u8,
    pub(crate) state: Mutex<ClientState>,
    /// One-slot chunk reassembly buffer. Touched only by the receive
    /// path, which is serialised per transport.
    pub(crate) chunk: Mutex<Option<ChunkBuffer>>,
    /// Bound driver. The async mutex is the probe/remove semaphore: an
    /// in-flight dispatch holds it, so removal waits the callback out.
    pub(crate) driver: tokio::sync::Mutex<Option<Arc<dyn Driver>>>,
    pub(crate) auth: Mutex<Option<AuthHandle>>,
    pub(crate) audio_task: Mutex<Option<JoinHandle<()>>>,
    ring: Arc<AudioRing>,
}

impl Client {
    pub(crate) fn new(id: u8) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(ClientState::default()),
            chunk: Mutex::new(None),
            driver: tokio::sync::Mutex::new(None),
            auth: Mutex::new(None),
            audio_task: Mutex::new(None),
            ring: Arc::new(AudioRing::with_default_capacity()),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().unwrap().lifecycle
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.state.lock().unwrap().lifecycle = lifecycle;
    }

    pub fn is_identified(&self) -> bool {
        self.lifecycle() == Lifecycle::Identified
    }

    pub fn announce(&self) -> Option<Announce> {
        self.state.lock().unwrap().announce.clone()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .identify
            .as_ref()
            .map(|identify| identify.class_names().to_vec())
            .unwrap_or_default()
    }

    pub fn audio_formats(&self) -> Vec<AudioFormatPair> {
        self.state
            .lock()
            .unwrap()
            .identify
            .as_ref()
            .and_then(|identify| identify.audio_formats.clone())
            .unwrap_or_default()
    }

    /// Negotiated configs once both sides have accepted.
    pub fn audio_configs(&self) -> Option<(AudioConfig, AudioConfig)> {
        let state = self.state.lock().unwrap();
        match (state.audio_in, state.audio_out) {
            (Some(inbound), Some(outbound)) if inbound.valid && outbound.valid => {
                Some((inbound, outbound))
            }
            _ => None,
        }
    }

    /// The outbound PCM ring the audio timer drains.
    pub fn audio_ring(&self) -> Arc<AudioRing> {
        self.ring.clone()
    }

    /// Abort the client's background tasks and drop transient buffers.
    /// Called on unregister and on adapter teardown.
    pub(crate) fn cancel_tasks(&self) {
        if let Some(auth) = self.auth.lock().unwrap().take() {
            auth.task.abort();
        }
        if let Some(task) = self.audio_task.lock().unwrap().take() {
            task.abort();
        }
        self.chunk.lock().unwrap().take();
    }
}
