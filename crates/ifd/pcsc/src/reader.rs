//! Reader snapshots taken through `SCardGetStatusChange`

use std::ffi::{CStr, CString};
use std::time::Duration;

use pcsc::{Context, ReaderState, State};
use tracing::trace;

/// Snapshot of one PC/SC reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PcscReader {
    name: CString,
    /// Event state without the changed flag, usable as the current state
    /// of a later status change wait
    state: State,
    atr: Option<Vec<u8>>,
}

impl PcscReader {
    pub(crate) fn new(name: CString, state: State, atr: Option<Vec<u8>>) -> Self {
        let mut state = state;
        state.remove(State::CHANGED);
        Self { name, state, atr }
    }

    fn from_reader_state(reader_state: &ReaderState) -> Self {
        let event_state = reader_state.event_state();
        let atr = has_card(event_state).then(|| reader_state.atr().to_vec());
        Self::new(reader_state.name().to_owned(), event_state, atr)
    }

    pub(crate) fn raw_name(&self) -> &CStr {
        &self.name
    }

    pub(crate) fn name(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }

    pub(crate) const fn state(&self) -> State {
        self.state
    }

    pub(crate) fn has_card(&self) -> bool {
        has_card(self.state)
    }

    pub(crate) fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }
}

fn has_card(state: State) -> bool {
    state.contains(State::PRESENT) && !state.contains(State::EMPTY)
}

/// Current state of every reader. A reader whose state cannot be read is
/// reported without a card.
pub(crate) fn snapshot(context: &Context) -> Result<Vec<PcscReader>, pcsc::Error> {
    let names = match context.list_readers_owned() {
        Ok(names) => names,
        Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let mut states: Vec<ReaderState> = names
        .iter()
        .map(|name| ReaderState::new(name.clone(), State::UNAWARE))
        .collect();
    match context.get_status_change(Duration::ZERO, &mut states) {
        Ok(()) => Ok(states.iter().map(PcscReader::from_reader_state).collect()),
        Err(e) if crate::error::is_service_gone(e) => Err(e),
        Err(e) => {
            trace!(error = %e, "reader status unavailable, assuming no cards");
            Ok(names
                .into_iter()
                .map(|name| PcscReader::new(name, State::UNAWARE, None))
                .collect())
        }
    }
}

/// Whether an ATR was synthesised by a contactless reader (PC/SC part 3,
/// `3B 8n 80 01`)
pub(crate) fn is_contactless_atr(atr: &[u8]) -> bool {
    matches!(atr, [0x3B, t0, 0x80, 0x01, ..] if t0 & 0xF0 == 0x80)
}
