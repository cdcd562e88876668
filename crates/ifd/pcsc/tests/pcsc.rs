//! Tests against the platform PC/SC service. They skip when no service or
//! no card is available.

use std::sync::Arc;
use std::time::Duration;

use ecard_ifd::scio::{ScioTerminals, TerminalFactory};
use ecard_ifd::{DisconnectAction, IfdService, InputApdu, WaitRequest, WaitResponse};
use ecard_ifd_pcsc::{PcscConfig, PcscTerminalFactory};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn terminals() -> Option<Arc<dyn ScioTerminals>> {
    match PcscTerminalFactory::default().create() {
        Ok(terminals) => Some(terminals),
        Err(e) => {
            println!("Skipping test, PC/SC not available: {e}");
            None
        }
    }
}

#[test]
fn test_list_terminals() {
    init_tracing();
    let Some(terminals) = terminals() else {
        return;
    };
    let list = match terminals.list() {
        Ok(list) => list,
        Err(e) => {
            println!("Could not list readers: {e}");
            return;
        }
    };
    for terminal in &list {
        let present = terminals.is_card_present(&terminal.name).unwrap_or(false);
        println!("{}: card present = {present}", terminal.name);
    }
    assert!(terminals.is_card_present("no such reader").is_err());
}

#[test]
fn test_wait_times_out() {
    init_tracing();
    if terminals().is_none() {
        return;
    }
    let factory = PcscTerminalFactory::new(PcscConfig::new().with_poll_interval(Duration::from_millis(50)));
    let service = IfdService::new(Arc::new(factory));
    let ctx = service.establish_context().unwrap();

    // the expected state equals the current one, nothing happens in 200 ms
    let current = service.get_status(&ctx, None).unwrap();
    let request = WaitRequest::new()
        .with_expected(current)
        .with_timeout(Duration::from_millis(200));
    match service.wait(&ctx, request).unwrap() {
        WaitResponse::Changed(changes) => println!("changes: {changes:?}"),
        WaitResponse::Session(_) => panic!("synchronous wait returned a session"),
    }
    service.release_context(&ctx).unwrap();
}

#[test]
fn test_transmit_to_first_card() {
    init_tracing();
    if terminals().is_none() {
        return;
    }
    let service = IfdService::new(Arc::new(PcscTerminalFactory::default()));
    let ctx = service.establish_context().unwrap();

    let statuses = service.get_status(&ctx, None).unwrap();
    let Some(status) = statuses.iter().find(|s| s.card_available()) else {
        println!("Skipping test, no card in any reader");
        service.release_context(&ctx).unwrap();
        return;
    };
    println!(
        "{}: ATR {}",
        status.name,
        status.slots[0].atr.as_deref().map(hex::encode).unwrap_or_default()
    );

    let slot = service.connect(&ctx, &status.name, true).unwrap();
    // SELECT MF, any status is fine
    let apdus = [InputApdu::new(vec![0x00, 0xA4, 0x00, 0x0C, 0x02, 0x3F, 0x00])];
    let response = service.transmit(&ctx, &slot, &apdus).unwrap();
    assert_eq!(response.responses.len(), 1);
    assert!(response.responses[0].len() >= 2);

    service.end_transaction(&ctx, &slot).unwrap();
    service
        .disconnect(&ctx, &slot, DisconnectAction::Leave)
        .unwrap();
    service.release_context(&ctx).unwrap();
}
