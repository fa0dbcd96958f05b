//! ZeroMQ fabric: frames over PUSH/PULL sockets, one inbound endpoint
//! per processing unit.
//!
//! Each unit binds a PULL socket at its per-rank endpoint and owns two
//! background pump tasks: the receive pump decodes inbound frames and
//! hands them to the demultiplexer, the send pump owns one lazily
//! connected PUSH socket per destination. The public `deliver` is a plain
//! queue append, so senders never touch a socket directly and never block
//! beyond transport buffering.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeromq::{PullSocket, PushSocket, Socket, SocketRecv, SocketSend};

use stellwerk_core::Rank;

use crate::error::StellwerkError;
use crate::fabric::{ContextId, Demux, Fabric, Inbox, Lane, WireFrame};
use crate::transport::Transport;

pub struct ZmqFabric {
    rank: Rank,
    units: u32,
    base: Transport,
    demux: Arc<Demux>,
    outbound: mpsc::UnboundedSender<(Rank, WireFrame)>,
}

impl ZmqFabric {
    /// Bind this unit's inbound endpoint and start the socket pumps.
    ///
    /// Must be called from within a tokio runtime; the pumps live as long
    /// as the runtime does.
    pub async fn connect(base: &Transport, rank: Rank, units: u32) -> Result<Self, StellwerkError> {
        let own = base.for_rank(rank);
        own.ensure_ipc_dir()?;
        own.remove_stale_socket()?;

        let mut pull = PullSocket::new();
        info!(rank, endpoint = %own, "binding unit PULL socket");
        pull.bind(&own.endpoint()).await?;

        let demux = Arc::new(Demux::new());
        let pump_demux = Arc::clone(&demux);
        tokio::spawn(async move {
            Self::recv_pump(pull, pump_demux).await;
        });

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pump_base = base.clone();
        tokio::spawn(async move {
            Self::send_pump(pump_base, outbound_rx).await;
        });

        Ok(Self {
            rank,
            units,
            base: base.clone(),
            demux,
            outbound,
        })
    }

    /// Decode inbound frames and hand them to the demultiplexer.
    ///
    /// A frame that does not decode is a protocol violation; the pump
    /// stops, which starves every route and brings the unit down.
    async fn recv_pump(mut pull: PullSocket, demux: Arc<Demux>) {
        loop {
            let zmq_msg = match pull.recv().await {
                Ok(m) => m,
                Err(e) => {
                    debug!(error = %e, "PULL recv loop ending");
                    break;
                }
            };
            let Some(bytes) = zmq_msg.iter().next() else {
                error!("empty ZMQ message on unit socket");
                break;
            };
            match WireFrame::from_bytes(bytes.as_ref()) {
                Ok(frame) => demux.route(frame),
                Err(e) => {
                    error!(error = %e, "malformed frame on unit socket — stopping receive pump");
                    break;
                }
            }
        }
    }

    /// Transmit queued frames, connecting one PUSH socket per destination
    /// on first use.
    async fn send_pump(base: Transport, mut rx: mpsc::UnboundedReceiver<(Rank, WireFrame)>) {
        let mut sockets: HashMap<Rank, PushSocket> = HashMap::new();

        while let Some((dest, frame)) = rx.recv().await {
            if !sockets.contains_key(&dest) {
                let endpoint = base.for_rank(dest).endpoint();
                let mut socket = PushSocket::new();
                match socket.connect(&endpoint).await {
                    Ok(()) => {
                        debug!(dest, endpoint = %endpoint, "connected PUSH socket");
                        sockets.insert(dest, socket);
                    }
                    Err(e) => {
                        warn!(dest, endpoint = %endpoint, error = %e, "PUSH connect failed, frame dropped");
                        continue;
                    }
                }
            }
            let socket = sockets.get_mut(&dest).expect("socket connected above");
            let bytes = match frame.to_bytes() {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "frame serialization failed");
                    continue;
                }
            };
            if let Err(e) = socket.send(bytes.into()).await {
                warn!(dest, error = %e, "PUSH send failed");
                sockets.remove(&dest);
            }
        }
    }

    pub fn base(&self) -> &Transport {
        &self.base
    }
}

impl Fabric for ZmqFabric {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn units(&self) -> u32 {
        self.units
    }

    fn deliver(&self, dest: Rank, frame: WireFrame) -> Result<(), StellwerkError> {
        self.outbound
            .send((dest, frame))
            .map_err(|_| StellwerkError::Transport("send pump gone".into()))
    }

    fn inbox(&self, ctx: ContextId, lane: Lane) -> Inbox {
        self.demux.take(ctx, lane)
    }

    fn retire(&self, ctx: ContextId) {
        self.demux.retire(ctx);
    }
}
