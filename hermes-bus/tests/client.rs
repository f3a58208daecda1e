use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use hermes_bus::{
    BusError,
    catalog::ServiceRecord,
    client::Client,
    command::Command,
    config::NodeConfig,
    envelope::{Envelope, Payload, Reply},
    reactor::{Reactor, SocketRole},
};
use serde_json::{Map, Value};
use tokio::time::timeout;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn timed_out_lookup_does_not_leak_into_the_next_one() -> Result<()> {
    let mut reactor = Reactor::new(NodeConfig::new("Amon Din").with_ip(LOCALHOST).with_port(0));
    let addr = reactor.register_socket("interface", SocketRole::Bind).await?;

    // The first lookup answers too late; later ones answer at once.
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    reactor.add_handler(
        Command::InfoReq,
        move |_: &Envelope| -> hermes_bus::Result<Option<Reply>> {
            let name = if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(300));
                "First"
            } else {
                "Second"
            };
            let mut body = Map::new();
            body.insert(
                name.to_string(),
                serde_json::to_value(ServiceRecord::new(LOCALHOST, 5247))?,
            );
            Ok(Some(Reply::message(
                Command::InfoRep,
                vec![Payload::Json(Value::Object(body))],
            )))
        },
    );
    let running = tokio::spawn(async move { reactor.run().await });

    let mut client = Client::connect(addr)
        .await?
        .with_timeout(Duration::from_millis(100));
    let err = client.services(None).await.unwrap_err();
    assert!(matches!(err, BusError::Timeout(_)), "{err}");

    // Let the slow reply land on the abandoned connection.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let services = client.services(None).await?;
    assert_eq!(services.keys().collect::<Vec<_>>(), vec!["Second"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.broker_addr(), addr);

    assert_eq!(Client::exit(addr, WAIT).await?, "Bye!");
    timeout(WAIT, running).await???;
    Ok(())
}
