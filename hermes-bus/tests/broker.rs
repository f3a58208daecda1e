use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use futures::future::join_all;
use hermes_bus::{
    BusError,
    broker::Broker,
    catalog::{ApproveAll, Catalog, ServiceRecord},
    client::Client,
    clock::{Clock, ManualClock, MonotonicClock},
    command::Command,
    config::{BrokerConfig, NodeConfig},
    envelope::{Payload, Response, encode},
    reactor::{ReactorHandle, ReactorState},
    transport::{ReqSocket, read_frames, write_frames},
};
use serde_json::json;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(2);

struct RunningBroker {
    addr: SocketAddr,
    catalog: Arc<Catalog>,
    handle: ReactorHandle,
    task: JoinHandle<hermes_bus::Result<()>>,
}

fn config() -> BrokerConfig {
    let mut config = BrokerConfig::new(NodeConfig::new("Amon Din").with_ip(LOCALHOST).with_port(0));
    config.beacon.enabled = false;
    config.rollcall_interval = Duration::from_millis(20);
    config
}

async fn spawn_broker(clock: Arc<dyn Clock>) -> Result<RunningBroker> {
    let broker = Broker::bind_with(config(), clock, ApproveAll).await?;
    let addr = broker.local_addr();
    let catalog = broker.catalog();
    let handle = broker.handle();
    let task = tokio::spawn(broker.run());
    Ok(RunningBroker {
        addr,
        catalog,
        handle,
        task,
    })
}

async fn register(addr: SocketAddr, name: &str, port: u16) -> Result<Response> {
    let mut record = ServiceRecord::new(LOCALHOST, port);
    record.topics = Some(vec!["weather".to_string()]);
    let body = record.registration_body(name)?;
    let reply = Client::request(addr, Command::Registration, vec![Payload::Json(body)], WAIT).await?;
    Ok(reply)
}

fn command_of(response: &Response) -> Option<Command> {
    match response {
        Response::Envelope(envelope) => Some(envelope.command()),
        Response::Notice(_) => None,
    }
}

async fn shut_down(broker: RunningBroker) -> Result<()> {
    let farewell = Client::exit(broker.addr, WAIT).await?;
    assert_eq!(farewell, "Bye!");
    timeout(WAIT, broker.task).await???;
    Ok(())
}

#[tokio::test]
async fn info_request_returns_registered_service() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;

    let reply = register(broker.addr, "Rohan", 5247).await?;
    assert_eq!(command_of(&reply), Some(Command::Approved));

    let mut client = Client::connect(broker.addr).await?;
    let services = client.services(None).await?;
    assert_eq!(services.len(), 1);
    let rohan = &services["Rohan"];
    assert_eq!(rohan.ip, LOCALHOST);
    assert_eq!(rohan.port, 5247);
    assert_eq!(rohan.liveliness, 1000);
    assert_eq!(rohan.retries, 3);
    assert_eq!(rohan.topics, Some(vec!["weather".to_string()]));

    let only = client.services(Some("Rohan")).await?;
    assert_eq!(only.keys().collect::<Vec<_>>(), vec!["Rohan"]);

    let missing = client.services(Some("Isengard")).await.unwrap_err();
    assert!(matches!(missing, BusError::NotFound(name) if name == "Isengard"));

    shut_down(broker).await
}

#[tokio::test]
async fn info_reply_uses_the_record_field_names() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;
    register(broker.addr, "Rohan", 5247).await?;

    let reply = Client::request(broker.addr, Command::InfoReq, vec![Payload::from("")], WAIT).await?;
    let Response::Envelope(envelope) = reply else {
        panic!("expected an Info_Rep envelope");
    };
    assert_eq!(envelope.command(), Command::InfoRep);
    let body: serde_json::Value = envelope.json_body()?;
    let fields: Vec<&str> = body["Rohan"]
        .as_object()
        .expect("record object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        fields,
        vec!["ip", "last_beat", "liveliness", "port", "retries", "topics"]
    );

    shut_down(broker).await
}

#[tokio::test]
async fn exit_stops_the_broker_and_releases_its_port() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;
    let addr = broker.addr;
    let mut handle = broker.handle.clone();
    assert_ne!(handle.state(), ReactorState::Stopped);

    shut_down(broker).await?;
    timeout(WAIT, handle.stopped()).await?;
    assert_eq!(handle.state(), ReactorState::Stopped);

    let rebound = TcpListener::bind(addr).await?;
    assert_eq!(rebound.local_addr()?, addr);
    Ok(())
}

#[tokio::test]
async fn malformed_envelope_gets_an_error_reply() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;

    // Skip the empty delimiter a request socket would add.
    let mut stream = TcpStream::connect(broker.addr).await?;
    write_frames(
        &mut stream,
        &[Bytes::from_static(b"oops"), Bytes::from_static(b"0x08")],
    )
    .await?;
    let reply = timeout(WAIT, read_frames(&mut stream)).await??;
    assert_eq!(
        reply,
        Some(vec![
            Bytes::new(),
            Bytes::from_static(b"Error: Invalid Message Envelope."),
        ])
    );

    // The broker keeps serving after bad input.
    let mut client = Client::connect(broker.addr).await?;
    assert!(client.services(None).await?.is_empty());

    shut_down(broker).await
}

#[tokio::test]
async fn unknown_and_unhandled_commands_are_refused() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;
    let mut socket = ReqSocket::connect(broker.addr).await?;

    for tag in [&b"0x42"[..], Command::Approved.tag()] {
        let reply = socket.request(&[Bytes::copy_from_slice(tag)], WAIT).await?;
        assert_eq!(
            Response::parse(&reply)?,
            Response::Notice("Error: unrecognized command".to_string())
        );
    }

    shut_down(broker).await
}

#[tokio::test]
async fn handler_errors_are_answered_not_fatal() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;

    let reply = Client::request(
        broker.addr,
        Command::Registration,
        vec![Payload::from("not json")],
        WAIT,
    )
    .await?;
    match reply {
        Response::Notice(text) => assert!(text.starts_with("Error: "), "{text}"),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(broker.catalog.is_empty());

    shut_down(broker).await
}

#[tokio::test]
async fn update_of_unknown_service_is_denied() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;

    let body = json!({"name": "Gondor", "port": 6000});
    let reply = Client::request(broker.addr, Command::Update, vec![Payload::Json(body)], WAIT).await?;
    let Response::Envelope(envelope) = reply else {
        panic!("expected a Denied envelope");
    };
    assert_eq!(envelope.command(), Command::Denied);
    let body: serde_json::Value = envelope.json_body()?;
    assert_eq!(body["Error"], "No Registered Service With the Name Gondor");
    assert!(broker.catalog.is_empty());

    shut_down(broker).await
}

#[tokio::test]
async fn concurrent_updates_never_interleave() -> Result<()> {
    let broker = spawn_broker(Arc::new(MonotonicClock::new())).await?;
    register(broker.addr, "Rohan", 5247).await?;

    let updates = (0..16u16).map(|i| {
        let body = json!({"name": "Rohan", "port": 7000 + i, "retries": 10 + u32::from(i)});
        Client::request(broker.addr, Command::Update, vec![Payload::Json(body)], WAIT)
    });
    for reply in join_all(updates).await {
        assert_eq!(command_of(&reply?), Some(Command::Acknowledged));
    }

    // Each update writes both fields under one lock, so they stay paired.
    let record = broker.catalog.get("Rohan").expect("Rohan registered");
    assert!((7000..7016).contains(&record.port));
    assert_eq!(u32::from(record.port - 7000) + 10, record.retries);
    assert_eq!(record.topics, Some(vec!["weather".to_string()]));

    shut_down(broker).await
}

#[tokio::test]
async fn silent_services_are_evicted_by_the_rollcall() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let broker = spawn_broker(clock.clone()).await?;
    register(broker.addr, "Rohan", 5247).await?;
    register(broker.addr, "Gondor", 5248).await?;

    clock.advance(Duration::from_millis(2500));
    let beat = Client::request(broker.addr, Command::Heartbeat, vec![Payload::from("Gondor")], WAIT).await?;
    assert_eq!(command_of(&beat), Some(Command::Acknowledged));
    clock.advance(Duration::from_millis(2500));

    timeout(WAIT, async {
        while broker.catalog.get("Rohan").is_some() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert!(broker.catalog.get("Gondor").is_some());

    let beat = Client::request(broker.addr, Command::Heartbeat, vec![Payload::from("Rohan")], WAIT).await?;
    assert_eq!(command_of(&beat), Some(Command::Denied));

    shut_down(broker).await
}
