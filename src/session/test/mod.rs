use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use super::*;
use crate::engine::{
    Activation, EventStatus, McpsKind, MibValue, MlmeKind, MlmeRequest, Status, DR, LORAWAN_1_0_3,
};
use crate::nvm::{self, NvmCategory};
use crate::{AppEui, AppKey, AppSKey, DevAddr, DevEui, JoinEui, JoinMode, NwkKey, NwkSKey};


use engine::{Call, EngineHandle, MockEngine};
use store::MemoryStore;

fn setup() -> (EngineHandle, Session<MockEngine>) {
    let (handle, mock) = MockEngine::new();
    let session = Session::new(mock).unwrap();
    assert!(handle.started());
    (handle, session)
}

fn setup_with_nvm() -> (EngineHandle, Session<MockEngine>, [Option<Vec<u8>>; 7]) {
    let mut blobs: [Option<Vec<u8>>; 7] = std::array::from_fn(|_| None);
    for (i, cat) in NvmCategory::ALL.iter().enumerate() {
        blobs[i] = Some(vec![*cat as u8 ^ 0xA5; 8 + i]);
    }
    let (handle, mock) = MockEngine::with_nvm(blobs.clone());
    let session = Session::new(mock).unwrap();
    (handle, session, blobs)
}

async fn wait_until(handle: &EngineHandle, pred: impl Fn(&[Call]) -> bool) {
    for _ in 0..500 {
        if pred(&handle.calls()) {
            return;
        }
        sleep(Duration::from_millis(2)).await;
    }
    panic!("engine never saw the expected call: {:?}", handle.calls());
}

fn position(calls: &[Call], wanted: &Call) -> usize {
    calls.iter().position(|c| c == wanted).unwrap_or_else(|| panic!("{wanted:?} not in {calls:?}"))
}

fn mcps_count(calls: &[Call]) -> usize {
    calls.iter().filter(|c| matches!(c, Call::Mcps { .. })).count()
}

fn otaa_all_fields() -> JoinMode {
    JoinMode::Otaa {
        dev_eui: Some(DevEui::from([0x11; 8])),
        join_eui: Some(JoinEui::from([0x22; 8])),
        nwk_key: Some(NwkKey::from([0x33; 16])),
        app_key: Some(AppKey::from([0x44; 16])),
    }
}

#[tokio::test]
async fn configure_join_send_scenario() {
    let (handle, mut session) = setup();

    let task = tokio::spawn(async move {
        session.configure(&SessionConfig { max_rx_error: 20, confirmed_tries: 4 })?;
        session.join(&otaa_all_fields()).await?;
        session.send(2, b"helloworld", true).await?;
        Ok::<_, Error>(session)
    });

    wait_until(&handle, |calls| calls.iter().any(|c| matches!(c, Call::Mlme(_)))).await;
    handle.mlme_confirm(MlmeKind::Join, EventStatus::Ok);

    wait_until(&handle, |calls| mcps_count(calls) == 1).await;
    handle.mcps_confirm(McpsKind::Confirmed, EventStatus::Ok);

    task.await.unwrap().unwrap();

    let calls = handle.calls();
    let configure = position(&calls, &Call::MibSet(MibValue::SystemMaxRxError(20)));
    let dev_eui = position(&calls, &Call::MibSet(MibValue::DevEui(DevEui::from([0x11; 8]))));
    let join = position(&calls, &Call::Mlme(MlmeRequest::Join { datarate: DR::_0 }));
    let query = position(&calls, &Call::QueryTxPossible(10));
    let send = position(
        &calls,
        &Call::Mcps { kind: McpsKind::Confirmed, fport: 2, len: 10, datarate: DR::_0, nb_trials: 4 },
    );
    assert!(configure < dev_eui && dev_eui < join && join < query && query < send);

    // all four OTAA fields were pushed before the join request
    assert!(position(&calls, &Call::MibSet(MibValue::JoinEui(JoinEui::from([0x22; 8])))) < join);
    assert!(position(&calls, &Call::MibSet(MibValue::NwkKey(NwkKey::from([0x33; 16])))) < join);
    assert!(position(&calls, &Call::MibSet(MibValue::AppKey(AppKey::from([0x44; 16])))) < join);
}

#[tokio::test]
async fn join_outcome_statuses_translate_coarsely() {
    for (event_status, expected) in
        [(EventStatus::JoinFail, Error::NotJoined), (EventStatus::Rx2Timeout, Error::Timeout)]
    {
        let (handle, mut session) = setup();
        let task = tokio::spawn(async move { session.join(&otaa_all_fields()).await });
        wait_until(&handle, |calls| calls.iter().any(|c| matches!(c, Call::Mlme(_)))).await;
        handle.mlme_confirm(MlmeKind::Join, event_status);
        assert_eq!(task.await.unwrap(), Err(expected));
    }
}

#[tokio::test]
async fn mib_set_failure_aborts_otaa_before_the_join_request() {
    let (handle, mut session) = setup();
    handle.fail_next_mib_set(Status::ParameterInvalid);

    // resolves without any event: the failed MIB write short-circuits
    let result = session.join(&otaa_all_fields()).await;
    assert_eq!(result, Err(Error::InvalidParameter));
    assert!(!handle.calls().iter().any(|c| matches!(c, Call::Mlme(_))));
}

#[tokio::test]
async fn join_request_submission_failure_is_fatal_without_waiting() {
    let (handle, mut session) = setup();
    handle.fail_next_mlme(Status::Busy);

    // resolves without any event: the rejected submission ends the attempt
    let result = session.join(&otaa_all_fields()).await;
    assert_eq!(result, Err(Error::Busy));
}

#[tokio::test]
async fn abp_join_programs_the_engine_locally() {
    let (handle, mut session) = setup();
    let nwk_skey = NwkSKey::from([0x55; 16]);
    let mode = JoinMode::Abp {
        dev_addr: DevAddr::from(0x0123_4567),
        nwk_skey,
        app_skey: AppSKey::from([0x66; 16]),
        app_eui: AppEui::from([0x77; 8]),
    };

    // purely local: no event is ever fired
    session.join(&mode).await.unwrap();

    let calls = handle.calls();
    assert_eq!(
        &calls[1..],
        &[
            Call::MibSet(MibValue::AbpVersion(LORAWAN_1_0_3)),
            Call::MibSet(MibValue::NetId(0)),
            Call::MibSet(MibValue::DevAddr(DevAddr::from(0x0123_4567))),
            Call::MibSet(MibValue::FNwkSIntKey(nwk_skey)),
            Call::MibSet(MibValue::SNwkSIntKey(nwk_skey)),
            Call::MibSet(MibValue::NwkSEncKey(nwk_skey)),
            Call::MibSet(MibValue::AppSKey(AppSKey::from([0x66; 16]))),
            Call::MibSet(MibValue::NetworkActivation(Activation::Abp)),
        ]
    );
}

#[tokio::test]
async fn oversized_payload_never_touches_the_engine() {
    let (handle, mut session) = setup();
    let result = session.send(1, &[0u8; 256], false).await;
    assert_eq!(result, Err(Error::InvalidParameter));
    assert_eq!(handle.calls(), vec![Call::Start]);
}

#[tokio::test]
async fn infeasible_length_flushes_mac_commands_and_asks_for_retry() {
    let (handle, mut session) = setup();
    handle.set_tx_possible(Err(Status::LengthError));

    let result = session.send(12, &[0u8; 100], false).await;
    assert_eq!(result, Err(Error::TryAgain));

    // exactly one empty unconfirmed frame went out in place of the payload
    let calls = handle.calls();
    assert_eq!(mcps_count(&calls), 1);
    position(
        &calls,
        &Call::Mcps { kind: McpsKind::Unconfirmed, fport: 0, len: 0, datarate: DR::_0, nb_trials: 1 },
    );

    // a subsequent send is not blocked
    handle.set_tx_possible(Ok(crate::engine::TxInfo {
        current_possible_payload: 242,
        max_possible_payload: 242,
    }));
    session.send(12, &[0u8; 100], false).await.unwrap();
    assert_eq!(mcps_count(&handle.calls()), 2);
}

#[tokio::test]
async fn failed_flush_submission_reports_the_engine_status() {
    let (handle, mut session) = setup();
    handle.set_tx_possible(Err(Status::LengthError));
    handle.fail_next_mcps(Status::Busy);

    let result = session.send(12, &[0u8; 100], false).await;
    assert_eq!(result, Err(Error::Busy));
}

#[tokio::test]
async fn unconfirmed_send_is_fire_and_forget() {
    let (handle, mut session) = setup();
    session.send(3, &[1, 2, 3], false).await.unwrap();

    // the engine's late confirm must not confuse later processing
    handle.mcps_confirm(McpsKind::Unconfirmed, EventStatus::Ok);
    session.process().await;

    static GOT: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    fn listener(dl: &crate::Downlink) {
        GOT.lock().unwrap().extend_from_slice(&dl.data);
    }
    session.listen(Port::Num(3), Some(listener)).unwrap();
    handle.downlink(3, &[9, 9]);
    session.process().await;
    assert_eq!(GOT.lock().unwrap().as_slice(), &[9, 9]);
}

#[tokio::test]
async fn send_uses_the_configured_datarate_and_tries() {
    let (handle, mut session) = setup();
    session.set_datarate(DR::_5, true).unwrap();
    assert_eq!(session.datarate(), DR::_5);
    assert!(session.adr_enabled());
    position(&handle.calls(), &Call::MibSet(MibValue::AdrEnable(true)));

    session.send(7, &[0u8; 4], false).await.unwrap();
    position(
        &handle.calls(),
        &Call::Mcps { kind: McpsKind::Unconfirmed, fport: 7, len: 4, datarate: DR::_5, nb_trials: 1 },
    );
}

#[tokio::test]
async fn class_b_is_rejected_without_an_engine_request() {
    let (handle, mut session) = setup();
    assert_eq!(session.set_class(Class::B), Err(Error::InvalidParameter));
    assert_eq!(handle.calls(), vec![Call::Start]);

    session.set_class(Class::C).unwrap();
    position(&handle.calls(), &Call::MibSet(MibValue::DeviceClass(crate::engine::DeviceClass::C)));
}

#[tokio::test]
async fn battery_level_callback_is_forwarded() {
    let (handle, mut session) = setup();
    fn battery() -> u8 {
        200
    }
    session.set_battery_level_callback(Some(battery));
    session.set_battery_level_callback(None);
    let calls = handle.calls();
    assert_eq!(&calls[1..], &[Call::SetBatteryProvider(true), Call::SetBatteryProvider(false)]);
}

#[tokio::test]
async fn downlink_reaches_the_most_recent_listener_for_the_port() {
    static FIRST: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
    static SECOND: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
    static FALLBACK: Mutex<Vec<(u8, Vec<u8>)>> = Mutex::new(Vec::new());

    fn first(dl: &crate::Downlink) {
        FIRST.lock().unwrap().push(dl.data.to_vec());
    }
    fn second(dl: &crate::Downlink) {
        SECOND.lock().unwrap().push(dl.data.to_vec());
    }
    fn fallback(dl: &crate::Downlink) {
        FALLBACK.lock().unwrap().push((dl.fport, dl.data.to_vec()));
    }

    let (handle, mut session) = setup();
    session.listen(Port::Any, Some(fallback)).unwrap();
    session.listen(Port::Num(2), Some(first)).unwrap();
    session.listen(Port::Num(2), Some(second)).unwrap();

    handle.downlink(2, &[1]);
    session.process().await;
    assert!(FIRST.lock().unwrap().is_empty());
    assert_eq!(SECOND.lock().unwrap().len(), 1);

    // unregistering sends port 2 to the fallback
    session.listen(Port::Num(2), None).unwrap();
    handle.downlink(2, &[2]);
    session.process().await;
    assert_eq!(SECOND.lock().unwrap().len(), 1);
    assert_eq!(FALLBACK.lock().unwrap().as_slice(), &[(2, vec![2])]);

    // a port nobody registered also lands on the fallback
    handle.downlink(42, &[3]);
    session.process().await;
    assert_eq!(FALLBACK.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_or_empty_indications_reach_no_listener() {
    static HITS: Mutex<usize> = Mutex::new(0);
    fn count(_: &crate::Downlink) {
        *HITS.lock().unwrap() += 1;
    }

    let (handle, mut session) = setup();
    session.listen(Port::Any, Some(count)).unwrap();

    handle.indicate(crate::engine::McpsIndication {
        status: EventStatus::MicFail,
        fport: Some(2),
        data: heapless::Vec::from_slice(&[1, 2]).unwrap(),
        quality: crate::radio::RxQuality::new(-60, 6),
        pending: false,
    });
    session.process().await;

    handle.indicate(crate::engine::McpsIndication {
        status: EventStatus::Ok,
        fport: None,
        data: heapless::Vec::new(),
        quality: crate::radio::RxQuality::new(-60, 6),
        pending: false,
    });
    session.process().await;

    assert_eq!(*HITS.lock().unwrap(), 0);
}

#[tokio::test]
async fn back_to_back_confirmed_sends_are_serialized() {
    let (handle, session) = setup();
    let session = Arc::new(tokio::sync::Mutex::new(session));

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.lock().await.send(1, b"one", true).await })
    };
    sleep(Duration::from_millis(10)).await;
    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.lock().await.send(2, b"two", true).await })
    };
    sleep(Duration::from_millis(10)).await;

    // the second submission must wait for the first confirmation
    assert_eq!(mcps_count(&handle.calls()), 1);

    handle.mcps_confirm(McpsKind::Confirmed, EventStatus::Ok);
    first.await.unwrap().unwrap();

    wait_until(&handle, |calls| mcps_count(calls) == 2).await;
    handle.mcps_confirm(McpsKind::Confirmed, EventStatus::Ok);
    second.await.unwrap().unwrap();

    let calls = handle.calls();
    let first_send = position(
        &calls,
        &Call::Mcps { kind: McpsKind::Confirmed, fport: 1, len: 3, datarate: DR::_0, nb_trials: 1 },
    );
    let second_send = position(
        &calls,
        &Call::Mcps { kind: McpsKind::Confirmed, fport: 2, len: 3, datarate: DR::_0, nb_trials: 1 },
    );
    assert!(first_send < second_send);
}

#[tokio::test]
async fn suspend_persists_every_exported_category() {
    let (handle, mut session, blobs) = setup_with_nvm();
    let mut store = MemoryStore::new();

    session.suspend(&mut store).unwrap();
    assert!(!handle.started());

    for (i, cat) in NvmCategory::ALL.iter().enumerate() {
        assert_eq!(store.get(cat.path()), blobs[i].as_deref());
    }
}

#[tokio::test]
async fn suspend_aborts_on_the_first_store_failure() {
    let (handle, mut session, _) = setup_with_nvm();
    let mut store = MemoryStore::new();
    store.fail_on(NvmCategory::Region.path());

    let result = session.suspend(&mut store);
    assert!(matches!(result, Err(nvm::Error::Store(_))));
    assert!(!handle.started());

    // Crypto, SecureElement and Mac made it; nothing after Region did.
    assert_eq!(store.len(), 3);
    assert!(store.contains(NvmCategory::Mac.path()));
    assert!(!store.contains(NvmCategory::ClassB.path()));
}

#[tokio::test]
async fn suspend_then_resume_round_trips_byte_identical_blobs() {
    let (handle, mut session, blobs) = setup_with_nvm();
    let mut store = MemoryStore::new();

    session.suspend(&mut store).unwrap();
    session.resume(&mut store).unwrap();

    for (i, cat) in NvmCategory::ALL.iter().enumerate() {
        assert_eq!(handle.restored(*cat), blobs[i]);
    }
    assert!(handle.installed());
    assert!(handle.started());
}

#[tokio::test]
async fn resume_fails_when_one_category_is_one_byte_short() {
    let (handle, mut session, _) = setup_with_nvm();
    let mut store = MemoryStore::new();

    session.suspend(&mut store).unwrap();
    store.truncate(NvmCategory::Mac.path());

    let result = session.resume(&mut store);
    assert_eq!(result, Err(nvm::Error::Session(Error::InvalidParameter)));
    assert!(!handle.installed());
    assert!(!handle.started());
}

#[tokio::test]
async fn resume_with_nothing_stored_fails_without_starting_the_engine() {
    let (handle, mut session, _) = setup_with_nvm();
    let mut store = MemoryStore::new();

    session.suspend(&mut store).unwrap();
    let mut empty = MemoryStore::new();
    let result = session.resume(&mut empty);
    assert_eq!(result, Err(nvm::Error::Session(Error::InvalidParameter)));
    assert!(!handle.started());
}

#[tokio::test]
async fn resume_ignores_unknown_keys() {
    let (handle, mut session, _) = setup_with_nvm();
    let mut store = MemoryStore::new();

    session.suspend(&mut store).unwrap();
    store.insert_raw("lorawan/state/Multicast", b"from a newer firmware");

    session.resume(&mut store).unwrap();
    assert!(handle.started());
    assert!(!handle
        .calls()
        .iter()
        .any(|c| matches!(c, Call::NvmRestore(_, len) if *len == b"from a newer firmware".len())));
}
