//! Card connections
//!
//! A PC/SC transaction borrows its card, so a connection cannot hand out the
//! card and keep a transaction open across calls. Each [`PcscCard`] therefore
//! owns a worker thread that holds the card, and the transaction while one
//! is active, and serves requests sent through a channel.

use std::fmt;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use ecard_ifd::scio::{ScioCard, ScioError, ScioErrorCode, ScioProtocol, ScioResult};
use pcsc::{Card, Disposition, Protocols, ShareMode, Transaction};
use tracing::{debug, trace, warn};

use crate::config::PcscConfig;
use crate::error::{PcscError, scio};

type Reply<T> = Sender<ScioResult<T>>;

enum Request {
    Transmit(Vec<u8>, Reply<Bytes>),
    Control(u32, Vec<u8>, Reply<Bytes>),
    BeginExclusive(Reply<()>),
    EndExclusive(Reply<()>),
    Reconnect(bool, Reply<()>),
    Disconnect(bool, Reply<()>),
}

const fn disposition(reset: bool) -> Disposition {
    if reset {
        Disposition::ResetCard
    } else {
        Disposition::LeaveCard
    }
}

/// PC/SC protocols requested for a provider protocol
pub(crate) const fn preferred_protocols(protocol: ScioProtocol) -> Protocols {
    match protocol {
        ScioProtocol::T0 => Protocols::T0,
        // contactless cards talk T=1 as far as PC/SC is concerned
        ScioProtocol::T1 | ScioProtocol::Tcl => Protocols::T1,
        ScioProtocol::Any => Protocols::ANY,
    }
}

struct Worker {
    terminal: String,
    share_mode: ShareMode,
    protocols: Protocols,
    auto_reconnect: bool,
    buffer: Vec<u8>,
}

impl Worker {
    fn transmit(&mut self, card: &Card, command: &[u8]) -> ScioResult<Bytes> {
        card.transmit(command, &mut self.buffer)
            .map(Bytes::copy_from_slice)
            .map_err(scio)
    }

    fn control(&mut self, card: &Card, code: u32, data: &[u8]) -> ScioResult<Bytes> {
        card.control(code.into(), data, &mut self.buffer)
            .map(Bytes::copy_from_slice)
            .map_err(scio)
    }

    fn reconnect(&self, card: &mut Card, reset: bool) -> ScioResult<()> {
        card.reconnect(self.share_mode, self.protocols, disposition(reset))
            .map_err(scio)
    }

    fn run(mut self, mut card: Card, requests: Receiver<Request>) {
        let mut pending = None;
        loop {
            let request = match pending.take() {
                Some(request) => request,
                None => match requests.recv() {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };
            match request {
                Request::Transmit(command, reply) => {
                    let mut result = self.transmit(&card, &command);
                    if self.auto_reconnect
                        && matches!(&result, Err(e) if e.code == ScioErrorCode::ResetCard)
                    {
                        debug!(terminal = %self.terminal, "card was reset, reconnecting");
                        if self.reconnect(&mut card, false).is_ok() {
                            result = self.transmit(&card, &command);
                        }
                    }
                    let _ = reply.send(result);
                }
                Request::Control(code, data, reply) => {
                    let _ = reply.send(self.control(&card, code, &data));
                }
                Request::BeginExclusive(reply) => match card.transaction() {
                    Ok(transaction) => {
                        trace!(terminal = %self.terminal, "transaction started");
                        let _ = reply.send(Ok(()));
                        pending = self.serve_transaction(transaction, &requests);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(scio(e)));
                    }
                },
                Request::EndExclusive(reply) => {
                    let _ = reply.send(Err(ScioError::new(
                        ScioErrorCode::NotReady,
                        "no transaction active",
                    )));
                }
                Request::Reconnect(reset, reply) => {
                    let _ = reply.send(self.reconnect(&mut card, reset));
                }
                Request::Disconnect(reset, reply) => {
                    let result = card
                        .disconnect(disposition(reset))
                        .map_err(|(_, e)| scio(e));
                    let _ = reply.send(result);
                    trace!(terminal = %self.terminal, "card worker stopped");
                    return;
                }
            }
        }

        // every handle was dropped without a disconnect
        if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
            debug!(terminal = %self.terminal, error = %e, "disconnect failed");
        }
        trace!(terminal = %self.terminal, "card worker stopped");
    }

    // Serves requests until the transaction ends. Requests needing the card
    // itself end the transaction and are handed back.
    fn serve_transaction(
        &mut self,
        transaction: Transaction<'_>,
        requests: &Receiver<Request>,
    ) -> Option<Request> {
        let mut depth = 1usize;
        loop {
            let request = requests.recv().ok()?;
            match request {
                Request::Transmit(command, reply) => {
                    let _ = reply.send(self.transmit(&transaction, &command));
                }
                Request::Control(code, data, reply) => {
                    let _ = reply.send(self.control(&transaction, code, &data));
                }
                Request::BeginExclusive(reply) => {
                    depth += 1;
                    let _ = reply.send(Ok(()));
                }
                Request::EndExclusive(reply) => {
                    depth -= 1;
                    if depth > 0 {
                        let _ = reply.send(Ok(()));
                        continue;
                    }
                    let result = transaction
                        .end(Disposition::LeaveCard)
                        .map_err(|(_, e)| scio(e));
                    trace!(terminal = %self.terminal, "transaction ended");
                    let _ = reply.send(result);
                    return None;
                }
                other => {
                    debug!(terminal = %self.terminal, "ending transaction for reconnect");
                    return Some(other);
                }
            }
        }
    }
}

/// Connection to a card, served by a worker thread
pub struct PcscCard {
    terminal: String,
    atr: Bytes,
    protocol: ScioProtocol,
    requests: Sender<Request>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for PcscCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscCard")
            .field("terminal", &self.terminal)
            .field("atr", &self.atr)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl PcscCard {
    /// Take over a freshly connected card
    pub(crate) fn spawn(
        terminal: &str,
        card: Card,
        protocol: ScioProtocol,
        config: &PcscConfig,
    ) -> Result<Self, PcscError> {
        let atr = card.get_attribute_owned(pcsc::Attribute::AtrString)?;
        let (tx, rx) = unbounded();
        let worker = Worker {
            terminal: terminal.to_owned(),
            share_mode: config.share_mode.into(),
            protocols: preferred_protocols(protocol),
            auto_reconnect: config.auto_reconnect,
            buffer: vec![0; pcsc::MAX_BUFFER_SIZE_EXTENDED],
        };
        let handle = thread::Builder::new()
            .name(format!("pcsc-card-{terminal}"))
            .spawn(move || worker.run(card, rx))
            .map_err(|e| PcscError::Other(format!("failed to start card worker: {e}")))?;
        debug!(terminal, %protocol, atr = %hex::encode(&atr), "card connected");

        Ok(Self {
            terminal: terminal.to_owned(),
            atr: Bytes::from(atr),
            protocol,
            requests: tx,
            worker: Some(handle),
        })
    }

    fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> ScioResult<T> {
        let gone = || ScioError::from(PcscError::WorkerGone(self.terminal.clone()));
        let (tx, rx) = bounded(1);
        self.requests.send(request(tx)).map_err(|_| gone())?;
        rx.recv().map_err(|_| gone())?
    }
}

impl ScioCard for PcscCard {
    fn atr(&self) -> Bytes {
        self.atr.clone()
    }

    fn protocol(&self) -> ScioProtocol {
        self.protocol
    }

    fn transmit(&mut self, command: &[u8]) -> ScioResult<Bytes> {
        self.call(|reply| Request::Transmit(command.to_vec(), reply))
    }

    fn transmit_control(&mut self, code: u32, data: &[u8]) -> ScioResult<Bytes> {
        self.call(|reply| Request::Control(code, data.to_vec(), reply))
    }

    fn begin_exclusive(&mut self) -> ScioResult<()> {
        self.call(Request::BeginExclusive)
    }

    fn end_exclusive(&mut self) -> ScioResult<()> {
        self.call(Request::EndExclusive)
    }

    fn reconnect(&mut self, reset: bool) -> ScioResult<()> {
        self.call(|reply| Request::Reconnect(reset, reply))
    }

    fn disconnect(mut self: Box<Self>, reset: bool) -> ScioResult<()> {
        let result = self.call(|reply| Request::Disconnect(reset, reply));
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(terminal = %self.terminal, "card worker panicked");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_protocols() {
        assert_eq!(preferred_protocols(ScioProtocol::T0), Protocols::T0);
        assert_eq!(preferred_protocols(ScioProtocol::Tcl), Protocols::T1);
        assert_eq!(preferred_protocols(ScioProtocol::Any), Protocols::ANY);
    }
}
