use core::time::Duration;

use jid::FullJid;
use minidom::Element;

use super::*;
use crate::stream::mock::MockStream;

fn balcony() -> FullJid {
    FullJid::new("ortuman@jackal.im/balcony").unwrap()
}

fn garden() -> FullJid {
    FullJid::new("juliet@jackal.im/garden").unwrap()
}

fn probing() -> PingConfig {
    PingConfig {
        send: true,
        send_interval: Duration::from_secs(3),
    }
}

fn iq(id: &str, payload: IqType) -> Iq {
    Iq {
        from: None,
        to: None,
        id: id.to_owned(),
        payload,
    }
}

fn ping_to(id: &str, to: Option<&str>) -> Iq {
    let mut iq = Iq::from_get(id, PingQuery);
    iq.from = Some(Jid::from(balcony()));
    iq.to = to.map(|to| Jid::new(to).unwrap());
    iq
}

fn pong(id: &str) -> Iq {
    iq(id, IqType::Result(None))
}

fn error_condition(elem: &Element) -> Option<String> {
    let error = elem.get_child("error", ns::JABBER_CLIENT)?;
    error.children().next().map(|cond| cond.name().to_owned())
}

fn assert_is_ping(elem: &Element) {
    assert!(elem.is("iq", ns::JABBER_CLIENT));
    assert_eq!(elem.attr("type"), Some("get"));
    assert!(elem.get_child("ping", ns::PING).is_some());
}

#[test]
fn test_matching() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(PingConfig::default(), stream.handle());

    assert_eq!(ping.associated_namespaces().to_vec(), vec!["urn:xmpp:ping"]);

    let request = ping_to("p1", None);
    assert!(ping.matches_iq(&request));
    assert!(ping.matches_iq(&request));
    assert!(ping.matches_iq(&iq("p2", IqType::Set(PingQuery.into()))));
    assert!(!ping.matches_iq(&iq(
        "v1",
        IqType::Get(Element::builder("query", "jabber:iq:version").build())
    )));
    assert!(!ping.matches_iq(&iq(
        "p3",
        IqType::Get(Element::builder("ping", "urn:example:not-ping").build())
    )));

    // Matching has no side effects.
    assert!(stream.try_fetch_element().is_none());
}

#[test]
fn test_receive_ping() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(PingConfig::default(), stream.handle());

    let mut request = Iq {
        from: Some(Jid::from(garden())),
        to: Some(Jid::from(garden())),
        id: String::from("abcd-1"),
        payload: IqType::Set(PingQuery.into()),
    };

    ping.process_iq(request.clone());
    let elem = stream.try_fetch_element().unwrap();
    assert_eq!(error_condition(&elem).as_deref(), Some("forbidden"));
    assert_eq!(elem.attr("id"), Some("abcd-1"));

    request.to = Some(Jid::from(balcony()));
    ping.process_iq(request.clone());
    let elem = stream.try_fetch_element().unwrap();
    assert_eq!(error_condition(&elem).as_deref(), Some("bad-request"));
    let error = elem.get_child("error", ns::JABBER_CLIENT).unwrap();
    assert_eq!(error.attr("type"), Some("modify"));

    request.payload = IqType::Get(PingQuery.into());
    ping.process_iq(request.clone());
    let elem = stream.try_fetch_element().unwrap();
    assert_eq!(elem.attr("type"), Some("result"));
    assert_eq!(elem.attr("id"), Some("abcd-1"));
    assert_eq!(elem.attr("to"), Some("juliet@jackal.im/garden"));
    assert!(elem.children().next().is_none());

    assert!(stream.try_fetch_element().is_none());
}

#[test]
fn test_invalid_payload() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(PingConfig::default(), stream.handle());

    let foreign = iq(
        "foreign",
        IqType::Get(Element::builder("query", "jabber:iq:version").build()),
    );
    ping.process_iq(foreign);
    let elem = stream.try_fetch_element().unwrap();
    assert_eq!(error_condition(&elem).as_deref(), Some("bad-request"));
    assert_eq!(elem.attr("id"), Some("foreign"));

    let stuffed: Element = "<ping xmlns='urn:xmpp:ping'><junk/></ping>".parse().unwrap();
    ping.process_iq(iq("stuffed", IqType::Get(stuffed)));
    let elem = stream.try_fetch_element().unwrap();
    assert_eq!(error_condition(&elem).as_deref(), Some("bad-request"));
    assert_eq!(elem.attr("id"), Some("stuffed"));
}

#[test]
fn test_addressing() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(PingConfig::default(), stream.handle());

    for to in [
        None,
        Some("jackal.im"),
        Some("JACKAL.IM"),
        Some("ortuman@jackal.im"),
        Some("ortuman@jackal.im/balcony"),
    ] {
        ping.process_iq(ping_to("p", to));
        let elem = stream.try_fetch_element().unwrap();
        assert_eq!(elem.attr("type"), Some("result"), "to={:?}", to);
    }

    for to in [
        "ortuman@jackal.im/garden",
        "juliet@jackal.im",
        "example.org",
        "jackal.im/balcony",
    ] {
        ping.process_iq(ping_to("p", Some(to)));
        let elem = stream.try_fetch_element().unwrap();
        assert_eq!(error_condition(&elem).as_deref(), Some("forbidden"), "to={}", to);
    }
}

#[test]
fn test_unbound_stream_only_answers_for_server() {
    let mut stream = MockStream::new("jackal.im", None);
    let ping = Ping::new(PingConfig::default(), stream.handle());

    ping.process_iq(ping_to("p1", Some("jackal.im")));
    assert_eq!(
        stream.try_fetch_element().unwrap().attr("type"),
        Some("result")
    );

    ping.process_iq(ping_to("p2", Some("ortuman@jackal.im")));
    assert_eq!(
        error_condition(&stream.try_fetch_element().unwrap()).as_deref(),
        Some("forbidden")
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_ping() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(probing(), stream.handle());
    ping.start();
    let started = Instant::now();

    // wait for ping...
    let elem = stream.fetch_element().await.unwrap();
    assert_is_ping(&elem);
    assert!(Instant::now() - started >= Duration::from_secs(3));

    // send pong...
    let id = elem.attr("id").unwrap().to_owned();
    let pong = pong(&id);
    assert!(ping.matches_response(&pong));
    ping.process_iq(pong);
    ping.on_activity();

    // wait next ping...
    let elem = stream.fetch_element().await.unwrap();
    assert_is_ping(&elem);
    assert_ne!(elem.attr("id"), Some(id.as_str()));

    // expect disconnection...
    assert_eq!(
        stream.wait_disconnection().await,
        Some(StreamError::ConnectionTimeout)
    );
    assert!(stream.try_fetch_element().is_none());
    ping.done();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(probing(), stream.handle());
    ping.start();

    // wait next ping...
    let elem = stream.fetch_element().await.unwrap();
    assert_is_ping(&elem);
    let sent = Instant::now();

    // expect disconnection...
    let reason = stream.wait_disconnection().await.unwrap();
    assert_eq!(reason.to_string(), "connection-timeout");
    let waited = Instant::now() - sent;
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_error_pong_proves_liveness() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(probing(), stream.handle());
    ping.start();

    let elem = stream.fetch_element().await.unwrap();
    let id = elem.attr("id").unwrap();
    ping.process_iq(iq(
        id,
        IqType::Error(stanza::stanza_error(DefinedCondition::ServiceUnavailable)),
    ));

    // Another probe after a full interval, no disconnection in between.
    let elem = stream.fetch_element().await.unwrap();
    assert_is_ping(&elem);
    assert_eq!(stream.disconnection(), None);
}

#[tokio::test(start_paused = true)]
async fn test_stale_pong_is_ignored() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(probing(), stream.handle());
    ping.start();

    stream.fetch_element().await.unwrap();
    let stale = pong(&format!("{}-stale", PING_PROBE_ID_PREFIX));
    assert!(ping.matches_response(&stale));
    ping.process_iq(stale);

    assert_eq!(
        stream.wait_disconnection().await,
        Some(StreamError::ConnectionTimeout)
    );
}

#[tokio::test(start_paused = true)]
async fn test_activity_delays_probe() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(probing(), stream.handle());
    ping.start();
    let started = Instant::now();

    tokio::time::sleep(Duration::from_secs(2)).await;
    ping.on_activity();

    stream.fetch_element().await.unwrap();
    let waited = Instant::now() - started;
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));

    // Activity while a probe is outstanding counts as the answer.
    tokio::time::sleep(Duration::from_millis(500)).await;
    ping.on_activity();
    let elem = stream.fetch_element().await.unwrap();
    assert_is_ping(&elem);
    assert_eq!(stream.disconnection(), None);
}

#[tokio::test(start_paused = true)]
async fn test_no_probes_unless_configured() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(PingConfig::default(), stream.handle());
    ping.start();
    ping.on_activity();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(stream.try_fetch_element().is_none());
    assert_eq!(stream.disconnection(), None);
}

#[tokio::test(start_paused = true)]
async fn test_done_is_idempotent() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(probing(), stream.handle());
    ping.start();
    ping.done();
    ping.done();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(stream.try_fetch_element().is_none());
    assert_eq!(stream.disconnection(), None);

    // Neither restarting nor activity revives a finished module.
    ping.start();
    ping.on_activity();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(stream.try_fetch_element().is_none());
    ping.done();
}

#[tokio::test(start_paused = true)]
async fn test_done_after_disconnection() {
    let mut stream = MockStream::new("jackal.im", Some(balcony()));
    let ping = Ping::new(probing(), stream.handle());
    ping.start();

    stream.fetch_element().await.unwrap();
    assert_eq!(
        stream.wait_disconnection().await,
        Some(StreamError::ConnectionTimeout)
    );
    ping.done();
    ping.done();
    drop(ping);
    assert!(stream.try_fetch_element().is_none());
}
