//! End-to-end scenarios driven over in-memory duplex links with a scripted
//! radio on the far side.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use holyrig::codec::{self, CodecError};
use holyrig::dispatch::Dispatcher;
use holyrig::link::{BoxedLink, LinkOpener};
use holyrig::rig::{self, RigError, RigSettings};
use holyrig::rpc::{self, codes, RpcFailure};
use holyrig::subscribe;
use holyrig::{model, schema};
use holyrig_types::{utils::hex_frame, Model, RigState, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const SCHEMA: &str = "\
version = 1

schema Transceiver {
    enum Vfo { Current, A, B, Unknown }
    enum Mode { LSB, USB, CW }

    fn set_freq(int freq);
    fn set_mode(Mode mode);
    fn set_vfo(Vfo vfo);

    status {
        int freq;
        Mode mode;
        bool transmit;
        Vfo vfo;
    }
}
";

const MODEL: &str = r#"
[general]
type = "transceiver"
version = 1

[enums.Vfo]
values = [["A", 1], ["B", 2]]

[enums.Mode]
values = [["LSB", 0], ["USB", 1], ["CW", 3]]

[[init]]
command = "11.22.19.FD"
validate = "11.22.FB.FD"

[commands.set_freq]
command = "11.22.33.??.??.??.??"
validate = "11.22.FB.FD"

[commands.set_freq.params.freq]
index = 3
format = "bcd_lu"
add = 100.0

[commands.set_mode]
command = "11.22.06.??.FD"
validate = "11.22.FB.FD"

[commands.set_mode.params.mode]
index = 3
length = 1
format = "int_bu"

[commands.set_vfo]
command = "11.22.07.??.FD"
validate = "11.22.FB.FD"

[commands.set_vfo.params.vfo]
index = 3
length = 1
format = "int_bu"

[status.freq]
command = "11.22.03.FD"
validate = "11.22.03.??.??.??.??.FD"
index = 3
format = "bcd_lu"

[status.mode]
command = "11.22.04.FD"
validate = "11.22.04.??.??.FD"
index = 3
length = 1
format = "int_bu"

[status.mode.fields.transmit]
index = 4
length = 1
format = "int_bu"
"#;

fn compiled_model() -> Arc<Model> {
    let schema = Arc::new(schema::compile(SCHEMA).unwrap());
    Arc::new(model::compile(MODEL, schema).unwrap())
}

fn fast_settings() -> RigSettings {
    RigSettings {
        poll_interval: Duration::from_millis(10),
        exchange_timeout: Duration::from_millis(100),
        init_retries: 3,
        init_backoff: Duration::from_millis(1),
        reconnect_interval: Duration::from_millis(50),
        timeout_budget: 2,
    }
}

struct OneShotOpener {
    link: Mutex<Option<DuplexStream>>,
}

impl OneShotOpener {
    fn new(link: DuplexStream) -> Box<Self> {
        Box::new(Self {
            link: Mutex::new(Some(link)),
        })
    }
}

#[async_trait]
impl LinkOpener for OneShotOpener {
    async fn open(&self) -> io::Result<BoxedLink> {
        match self.link.lock().unwrap().take() {
            Some(link) => Ok(Box::new(link)),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "gone")),
        }
    }
}

/// Runs a scripted radio: every received frame is answered by `script`.
fn spawn_radio<F>(mut port: DuplexStream, mut script: F)
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 256];
        loop {
            let Ok(n) = port.read(&mut buf).await else { return };
            if n == 0 {
                return;
            }
            if let Some(reply) = script(&buf[..n]) {
                if port.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    });
}

/// Default radio behavior: ack everything, answer polls from shared state.
fn friendly_radio(freq: u32, mode: u8, transmit: u8) -> impl FnMut(&[u8]) -> Option<Vec<u8>> {
    move |frame: &[u8]| {
        Some(match frame.get(2) {
            Some(0x19) => vec![0x11, 0x22, 0xFB, 0xFD],
            Some(0x03) => {
                let mut reply = vec![0x11, 0x22, 0x03];
                reply.extend_from_slice(&bcd_le(freq));
                reply.push(0xFD);
                reply
            }
            Some(0x04) => vec![0x11, 0x22, 0x04, mode, transmit, 0xFD],
            _ => vec![0x11, 0x22, 0xFB, 0xFD],
        })
    }
}

/// 4-byte little-endian BCD, enough for the test frequencies.
fn bcd_le(mut value: u32) -> [u8; 4] {
    let mut out = [0u8; 4];
    for slot in out.iter_mut() {
        let pair = (value % 100) as u8;
        *slot = ((pair / 10) << 4) | (pair % 10);
        value /= 100;
    }
    out
}

fn spawn_rig_with_radio<F>(
    id: &str,
    script: F,
    updates: mpsc::Sender<rig::StatusUpdate>,
) -> rig::RigHandle
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let (near, far) = tokio::io::duplex(1024);
    spawn_radio(far, script);
    rig::spawn(
        id.to_owned(),
        compiled_model(),
        OneShotOpener::new(near),
        fast_settings(),
        updates,
    )
}

// -------------------------------------------------------------------------
// set_freq encoding, including the overflow side
// -------------------------------------------------------------------------

#[test]
fn set_freq_builds_the_documented_frame() {
    let model = compiled_model();

    let mut args = BTreeMap::new();
    args.insert("freq".to_owned(), Value::Int(14_250_000));
    let frame = codec::encode_command(&model, "set_freq", &args).unwrap();
    assert_eq!("11.22.33.00.01.25.14", hex_frame(&frame));
}

#[test]
fn set_freq_transform_overflow_is_rejected() {
    // A multiply of 1000 pushes the transformed value past what four BCD
    // bytes can hold.
    let schema = Arc::new(schema::compile(SCHEMA).unwrap());
    let source = MODEL.replace("add = 100.0", "add = 100.0\nmultiply = 1000.0");
    let model = model::compile(&source, schema).unwrap();

    let mut args = BTreeMap::new();
    args.insert("freq".to_owned(), Value::Int(14_250_000));
    let got = codec::encode_command(&model, "set_freq", &args);
    assert!(matches!(got, Err(CodecError::ValueOutOfRange { .. })));
}

// -------------------------------------------------------------------------
// validation mask reject, surfaced as a communication error
// -------------------------------------------------------------------------

#[tokio::test]
async fn bad_ack_is_a_communication_error() {
    // The radio acks init properly but answers commands with a wrong tail.
    let (updates_tx, _updates_rx) = mpsc::channel(16);
    let handle = spawn_rig_with_radio(
        "rig",
        |frame: &[u8]| {
            Some(match frame.get(2) {
                Some(0x19) => vec![0x11, 0x22, 0xFB, 0xFD],
                Some(0x03) => {
                    let mut reply = vec![0x11, 0x22, 0x03];
                    reply.extend_from_slice(&bcd_le(7_074_000));
                    reply.push(0xFD);
                    reply
                }
                Some(0x04) => vec![0x11, 0x22, 0x04, 0, 0, 0xFD],
                _ => vec![0x11, 0x22, 0x10, 0xDE],
            })
        },
        updates_tx,
    );

    let mut args = BTreeMap::new();
    args.insert("vfo".to_owned(), Value::Enum("A".into()));
    let got = handle.execute("set_vfo".into(), args).await.unwrap_err();

    let RigError::Codec(ref codec_error) = got else {
        panic!("expected codec error, got {got:?}");
    };
    assert!(matches!(
        codec_error,
        CodecError::ReplyValidationFailed { .. }
    ));

    // ...and the dispatcher maps it to the rig-communication code.
    let failure = RpcFailure::from(got);
    assert_eq!(codes::RIG_COMMUNICATION_ERROR, failure.code);
}

// -------------------------------------------------------------------------
// enum lookup on decode
// -------------------------------------------------------------------------

#[test]
fn enum_members_resolve_on_decode() {
    let schema = Arc::new(schema::compile(SCHEMA).unwrap());
    let source = format!(
        "{MODEL}\n{}",
        r#"
[status.vfo]
command = "11.22.09.FD"
validate = "11.22.09.??.FD"
index = 3
length = 1
format = "int_bu"
"#
    );
    let model = model::compile(&source, schema).unwrap();
    let (_, poll) = model
        .status_polls()
        .iter()
        .find(|(name, _)| name == "vfo")
        .unwrap();

    let values = codec::decode_status(&model, poll, &[0x11, 0x22, 0x09, 2, 0xFD]).unwrap();
    assert_eq!(
        vec![("vfo".to_owned(), Value::Enum("B".into()))],
        values
    );

    let got = codec::decode_status(&model, poll, &[0x11, 0x22, 0x09, 7, 0xFD]);
    assert!(matches!(
        got,
        Err(CodecError::UnknownEnumValue { raw: 7, .. })
    ));
}

// -------------------------------------------------------------------------
// subscriptions deliver only intersecting fields
// -------------------------------------------------------------------------

#[tokio::test]
async fn subscription_delivers_only_subscribed_fields() {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    let subscriptions = subscribe::spawn(outbound_tx, 16);

    let handle = spawn_rig_with_radio(
        "ic7300",
        friendly_radio(14_250_000, 1, 0),
        subscriptions.updates.clone(),
    );

    let mut rigs = BTreeMap::new();
    rigs.insert("ic7300".to_owned(), handle);
    let dispatcher = Arc::new(Dispatcher::new(
        rigs,
        BTreeSet::new(),
        subscriptions.requests.clone(),
    ));

    let peer = "127.0.0.1:9999".parse().unwrap();
    let result = dispatcher
        .dispatch(
            "subscribe_status",
            serde_json::json!({"rig_id": "ic7300", "fields": ["freq", "mode"]}),
            peer,
        )
        .await
        .unwrap();
    assert_eq!("sub_1", result["subscription_id"]);

    // The first polls publish freq, mode, and transmit; the notification
    // must carry only the subscribed intersection.
    let mut seen = BTreeMap::new();
    while seen.len() < 2 {
        let datagram = outbound_rx.recv().await.unwrap();
        assert_eq!(peer, datagram.peer);
        let json: serde_json::Value = serde_json::from_slice(&datagram.payload).unwrap();
        assert_eq!("status_update", json["method"]);
        assert!(json["params"]["updates"].get("transmit").is_none());
        let updates = json["params"]["updates"].as_object().unwrap();
        for (field, value) in updates {
            seen.insert(field.clone(), value.clone());
        }
    }

    assert_eq!(Some(&serde_json::json!(14_250_000)), seen.get("freq"));
    assert_eq!(Some(&serde_json::json!("USB")), seen.get("mode"));
}

// -------------------------------------------------------------------------
// init retry exhaustion leaves the rig NotResponding
// -------------------------------------------------------------------------

#[tokio::test]
async fn init_retry_exhaustion_goes_not_responding() {
    let (updates_tx, _updates_rx) = mpsc::channel(16);
    let init_attempts = Arc::new(Mutex::new(0u32));
    let counted = init_attempts.clone();

    let handle = spawn_rig_with_radio(
        "dead",
        move |frame: &[u8]| {
            if frame.get(2) == Some(&0x19) {
                *counted.lock().unwrap() += 1;
            }
            Some(vec![0x11, 0x22, 0x00, 0xFD])
        },
        updates_tx,
    );

    let (subs_tx, _subs_rx) = mpsc::channel(4);
    let mut rigs = BTreeMap::new();
    rigs.insert("dead".to_owned(), handle.clone());
    let dispatcher = Dispatcher::new(rigs, BTreeSet::new(), subs_tx);

    // Wait for the retries to run out.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while handle.state() != RigState::NotResponding {
        assert!(tokio::time::Instant::now() < deadline, "never gave up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(3, *init_attempts.lock().unwrap());

    let peer = "127.0.0.1:1".parse().unwrap();
    let rigs = dispatcher
        .dispatch("list_rigs", serde_json::Value::Null, peer)
        .await
        .unwrap();
    assert_eq!(serde_json::json!({"dead": false}), rigs);
}

// -------------------------------------------------------------------------
// text format, signed
// -------------------------------------------------------------------------

#[test]
fn text_format_encodes_negative_values() {
    let schema = Arc::new(schema::compile(SCHEMA).unwrap());
    let source = MODEL
        .replace("format = \"bcd_lu\"\nadd = 100.0", "format = \"text\"")
        .replace("command = \"11.22.33.??.??.??.??\"", "command = \"(FRQ)??.??.??.??\"");
    let model = model::compile(&source, schema).unwrap();

    // -418 is not reachable through the u32 RPC surface, but the codec
    // itself must produce the signed text form.
    let spec = model
        .command("set_freq")
        .unwrap()
        .binding("freq")
        .unwrap()
        .clone();
    let bytes = holyrig::codec::encode::encode_field(-418, &spec).unwrap();
    assert_eq!(vec![0x2D, 0x34, 0x31, 0x38], bytes);
}

// -------------------------------------------------------------------------
// Ordering and idempotence properties
// -------------------------------------------------------------------------

#[tokio::test]
async fn commands_complete_in_submission_order() {
    let (updates_tx, _updates_rx) = mpsc::channel(16);
    let handle = spawn_rig_with_radio("rig", friendly_radio(1, 0, 0), updates_tx);

    let completions = Arc::new(Mutex::new(Vec::new()));

    let mut mode_args = BTreeMap::new();
    mode_args.insert("mode".to_owned(), Value::Enum("CW".into()));
    let mut vfo_args = BTreeMap::new();
    vfo_args.insert("vfo".to_owned(), Value::Enum("A".into()));

    let first = {
        let handle = handle.clone();
        let completions = completions.clone();
        async move {
            handle.execute("set_mode".into(), mode_args).await.unwrap();
            completions.lock().unwrap().push("c1");
        }
    };
    let second = {
        let handle = handle.clone();
        let completions = completions.clone();
        async move {
            handle.execute("set_vfo".into(), vfo_args).await.unwrap();
            completions.lock().unwrap().push("c2");
        }
    };

    tokio::join!(first, second);
    assert_eq!(vec!["c1", "c2"], *completions.lock().unwrap());
}

#[test]
fn enum_encode_decode_idempotent() {
    let model = compiled_model();

    let mut args = BTreeMap::new();
    args.insert("mode".to_owned(), Value::Enum("CW".into()));
    let frame = codec::encode_command(&model, "set_mode", &args).unwrap();
    // CW maps to 3 in this model.
    assert_eq!(3, frame[3]);

    let (_, poll) = model
        .status_polls()
        .iter()
        .find(|(name, _)| name == "mode")
        .unwrap();
    let values = codec::decode_status(&model, poll, &[0x11, 0x22, 0x04, 3, 0, 0xFD]).unwrap();
    assert!(values.contains(&("mode".to_owned(), Value::Enum("CW".into()))));
}

#[tokio::test]
async fn unsupported_enum_member_is_invalid_params() {
    let (updates_tx, _updates_rx) = mpsc::channel(16);
    let handle = spawn_rig_with_radio("rig", friendly_radio(1, 0, 0), updates_tx);

    // `Current` is declared by the schema but unmapped in the model.
    let mut args = BTreeMap::new();
    args.insert("vfo".to_owned(), Value::Enum("Current".into()));
    let got = handle.execute("set_vfo".into(), args).await.unwrap_err();
    assert!(got.is_invalid_params());
    assert_eq!(
        codes::INVALID_COMMAND_PARAMETERS,
        RpcFailure::from(got).code
    );
}

// -------------------------------------------------------------------------
// RPC surface end to end (datagram level, no real socket)
// -------------------------------------------------------------------------

#[tokio::test]
async fn execute_command_over_rpc() {
    let (outbound_tx, _outbound_rx) = mpsc::channel(64);
    let subscriptions = subscribe::spawn(outbound_tx, 16);
    let handle = spawn_rig_with_radio(
        "ic7300",
        friendly_radio(14_250_000, 1, 0),
        subscriptions.updates.clone(),
    );

    let mut rigs = BTreeMap::new();
    rigs.insert("ic7300".to_owned(), handle);
    let dispatcher = Dispatcher::new(rigs, BTreeSet::new(), subscriptions.requests.clone());
    let peer = "127.0.0.1:1".parse().unwrap();

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "execute_command",
        "params": {
            "rig_id": "ic7300",
            "command": "set_freq",
            "parameters": {"freq": 7_074_000},
        },
    });
    let response =
        rpc::handle_datagram(&dispatcher, &serde_json::to_vec(&request).unwrap(), peer)
            .await
            .unwrap();
    let rendered = serde_json::to_value(&response).unwrap();
    assert_eq!(serde_json::json!({"success": true}), rendered["result"]);
    assert_eq!(1, rendered["id"]);

    // Unknown command → invalid command parameters.
    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "execute_command",
        "params": {"rig_id": "ic7300", "command": "warp", "parameters": {}},
    });
    let response =
        rpc::handle_datagram(&dispatcher, &serde_json::to_vec(&request).unwrap(), peer)
            .await
            .unwrap();
    let rendered = serde_json::to_value(&response).unwrap();
    assert_eq!(
        codes::INVALID_COMMAND_PARAMETERS,
        rendered["error"]["code"]
    );

    // Unparseable datagram → parse error with a null id.
    let response = rpc::handle_datagram(&dispatcher, b"{not json", peer).await.unwrap();
    let rendered = serde_json::to_value(&response).unwrap();
    assert_eq!(codes::PARSE_ERROR, rendered["error"]["code"]);
    assert!(rendered["id"].is_null());
}

#[tokio::test]
async fn capabilities_reflect_supported_subset() {
    let (outbound_tx, _outbound_rx) = mpsc::channel(64);
    let subscriptions = subscribe::spawn(outbound_tx, 16);
    let handle = spawn_rig_with_radio(
        "ic7300",
        friendly_radio(1, 0, 0),
        subscriptions.updates.clone(),
    );

    let mut rigs = BTreeMap::new();
    rigs.insert("ic7300".to_owned(), handle);
    let dispatcher = Dispatcher::new(rigs, BTreeSet::new(), subscriptions.requests.clone());
    let peer = "127.0.0.1:1".parse().unwrap();

    let result = dispatcher
        .dispatch(
            "get_capabilities",
            serde_json::json!({"rig_id": "ic7300"}),
            peer,
        )
        .await
        .unwrap();

    let commands = result["commands"].as_object().unwrap();
    assert!(commands.contains_key("set_freq"));
    assert!(commands.contains_key("set_mode"));
    assert_eq!(
        "number",
        result["commands"]["set_freq"]["parameters"]["freq"]
    );
    assert_eq!("string", result["commands"]["set_vfo"]["parameters"]["vfo"]);

    // The status_fields reflect what the model actually polls; `vfo` is
    // declared by the schema but has no poll in this model.
    let status_fields = result["status_fields"].as_object().unwrap();
    assert_eq!("number", status_fields["freq"]);
    assert_eq!("string", status_fields["mode"]);
    assert_eq!("number", status_fields["transmit"]);
    assert!(!status_fields.contains_key("vfo"));
}
