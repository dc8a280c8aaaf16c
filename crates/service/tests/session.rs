mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result};
use bytes::Bytes;
use codec::{IceCandidate, SdpType, SessionDescription};
use common::{settle, wait_until};
use parking_lot::Mutex;
use rtc_link_service::{
    NegotiationError, Reliability, Session, SessionConfig, SessionError, SessionHandler,
    SessionState,
    engine::{
        ChannelState, ConnectionState,
        mock::{Fault, MockEngine},
    },
};

#[derive(Default)]
struct Counts {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    failed: AtomicUsize,
    messages: Mutex<Vec<(usize, Bytes)>>,
}

#[derive(Default, Clone)]
struct Counter(Arc<Counts>);

impl Counter {
    fn connected(&self) -> usize {
        self.0.connected.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> usize {
        self.0.disconnected.load(Ordering::SeqCst)
    }

    fn failed(&self) -> usize {
        self.0.failed.load(Ordering::SeqCst)
    }

    fn messages(&self) -> Vec<(usize, Bytes)> {
        self.0.messages.lock().clone()
    }
}

impl SessionHandler for Counter {
    fn on_connected(&self) {
        self.0.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.0.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, channel: usize, data: Bytes) {
        self.0.messages.lock().push((channel, data));
    }

    fn on_failed(&self, _reason: &str) {
        self.0.failed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default, Clone)]
struct Gathered(Arc<Mutex<Vec<IceCandidate>>>);

impl Gathered {
    fn sink(&self) -> impl Fn(IceCandidate) + Send + Sync + 'static {
        let inner = self.0.clone();
        move |candidate| inner.lock().push(candidate)
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }

    fn take(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut *self.0.lock())
    }
}

type MockSession = Session<MockEngine>;

async fn negotiate(engine: &MockEngine, config: &SessionConfig) -> Result<(MockSession, MockSession)> {
    let (offered, answered) = (Gathered::default(), Gathered::default());

    let offerer = Session::create_offer(engine, config, offered.sink()).await?;
    let offer = offerer.local_description().context("offer not committed")?;

    let answerer = Session::create_answer(engine, config, answered.sink(), offer).await?;
    let answer = answerer.local_description().context("answer not committed")?;
    offerer.apply_answer(answer).await?;

    wait_until("offer candidates", || offered.len() == 2).await?;
    wait_until("answer candidates", || answered.len() == 2).await?;

    for candidate in offered.take() {
        answerer.add_ice_candidate(candidate).await;
    }

    for candidate in answered.take() {
        offerer.add_ice_candidate(candidate).await;
    }

    Ok((offerer, answerer))
}

#[tokio::test]
async fn local_candidates_follow_the_commit_in_order() -> Result<()> {
    let engine = MockEngine::new();
    let gathered = Gathered::default();

    let session = Session::create_offer(&engine, &SessionConfig::default(), gathered.sink()).await?;
    assert!(session.is_offerer());
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.local_description().is_some());

    wait_until("candidates", || gathered.len() == 2).await?;

    let ports = gathered
        .take()
        .iter()
        .map(|it| it.candidate.split(' ').nth(5).unwrap_or_default().to_string())
        .collect::<Vec<_>>();

    assert_eq!(ports, vec!["50001", "50002"]);
    Ok(())
}

#[tokio::test]
async fn no_local_candidate_before_the_description_is_committed() -> Result<()> {
    let engine = MockEngine::new();
    let gathered = Gathered::default();
    engine.hold_commits();

    let offer = {
        let (engine, sink) = (engine.clone(), gathered.sink());
        tokio::spawn(async move { Session::create_offer(&engine, &SessionConfig::default(), sink).await })
    };

    // the offer and its first candidate exist, the commit is still pending
    settle().await;
    assert!(!offer.is_finished());
    assert_eq!(gathered.len(), 0);

    engine.release_commits();
    let session = offer.await??;
    assert!(session.local_description().is_some());

    wait_until("candidates", || gathered.len() == 2).await?;
    Ok(())
}

#[tokio::test]
async fn negotiated_sessions_connect_and_exchange_data() -> Result<()> {
    let engine = MockEngine::new();
    let (offerer, answerer) = negotiate(&engine, &SessionConfig::default()).await?;

    let (offer_events, answer_events) = (Counter::default(), Counter::default());
    offerer.subscribe(offer_events.clone())?;
    answerer.subscribe(answer_events.clone())?;

    wait_until("offerer connected", || offer_events.connected() == 1).await?;
    wait_until("answerer connected", || answer_events.connected() == 1).await?;

    assert_eq!(offerer.state(), SessionState::Connected);
    assert_eq!(answerer.state(), SessionState::Connected);
    assert!(offerer.is_connected() && answerer.is_connected());

    offerer.send(0, Bytes::from_static(b"hello")).await?;
    answerer.send(1, Bytes::from_static(b"world")).await?;

    wait_until("answerer message", || answer_events.messages().len() == 1).await?;
    wait_until("offerer message", || offer_events.messages().len() == 1).await?;

    assert_eq!(answer_events.messages(), vec![(0, Bytes::from_static(b"hello"))]);
    assert_eq!(offer_events.messages(), vec![(1, Bytes::from_static(b"world"))]);
    Ok(())
}

#[tokio::test]
async fn connected_is_raised_on_the_rising_edge_only() -> Result<()> {
    let engine = MockEngine::new().with_manual_channels();
    let session = Session::create_offer(&engine, &SessionConfig::default(), |_| ()).await?;

    let events = Counter::default();
    session.subscribe(events.clone())?;

    let connection = session.connection();
    connection.emit_channel_state("0", ChannelState::Open);
    settle().await;
    assert_eq!(events.connected(), 0);
    assert!(!session.channels_open());

    connection.emit_channel_state("1", ChannelState::Open);
    wait_until("connected", || events.connected() == 1).await?;
    assert_eq!(session.state(), SessionState::Connected);

    connection.emit_channel_state("1", ChannelState::Open);
    settle().await;
    assert_eq!(events.connected(), 1);

    connection.emit_channel_state("0", ChannelState::Closed);
    wait_until("disconnected", || events.disconnected() == 1).await?;

    connection.emit_channel_state("1", ChannelState::Closed);
    settle().await;
    assert_eq!(events.disconnected(), 1);
    assert_eq!(session.state(), SessionState::Connected);

    connection.emit_channel_state("0", ChannelState::Open);
    connection.emit_channel_state("1", ChannelState::Open);
    wait_until("connected again", || events.connected() == 2).await?;
    Ok(())
}

#[tokio::test]
async fn close_twice_raises_one_disconnect() -> Result<()> {
    let engine = MockEngine::new();
    let (offerer, answerer) = negotiate(&engine, &SessionConfig::default()).await?;

    let (offer_events, answer_events) = (Counter::default(), Counter::default());
    offerer.subscribe(offer_events.clone())?;
    answerer.subscribe(answer_events.clone())?;

    wait_until("connected", || offer_events.connected() == 1).await?;
    wait_until("connected", || answer_events.connected() == 1).await?;
    assert_eq!(engine.live_connections(), 2);

    offerer.close().await;
    offerer.close().await;

    wait_until("offerer disconnected", || offer_events.disconnected() == 1).await?;
    wait_until("answerer disconnected", || answer_events.disconnected() == 1).await?;

    settle().await;
    assert_eq!(offer_events.disconnected(), 1);
    assert_eq!(offerer.state(), SessionState::Closed);
    assert_eq!(offerer.channel_state(0), Some(ChannelState::Closed));
    assert!(offerer.connection().is_closed());
    assert_eq!(engine.live_connections(), 1);

    answerer.close().await;
    assert_eq!(engine.live_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn late_candidate_on_closed_session_is_ignored() -> Result<()> {
    let engine = MockEngine::new();
    let session = Session::create_offer(&engine, &SessionConfig::default(), |_| ()).await?;

    session.close().await;
    session
        .add_ice_candidate(IceCandidate::new(
            "candidate:9 1 udp 2130706431 127.0.0.1 50001 typ host",
        ))
        .await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(engine.live_connections(), 0);
    assert!(matches!(
        session.send(0, Bytes::from_static(b"x")).await,
        Err(SessionError::Closed)
    ));

    Ok(())
}

#[tokio::test]
async fn send_checks_the_channel() -> Result<()> {
    let engine = MockEngine::new();
    let session = Session::create_offer(&engine, &SessionConfig::default(), |_| ()).await?;

    assert!(matches!(
        session.send(5, Bytes::from_static(b"x")).await,
        Err(SessionError::InvalidChannel(5))
    ));

    assert!(matches!(
        session.send(0, Bytes::from_static(b"x")).await,
        Err(SessionError::ChannelNotOpen(0))
    ));

    Ok(())
}

#[tokio::test]
async fn only_one_handler_per_session() -> Result<()> {
    let engine = MockEngine::new();
    let session = Session::create_offer(&engine, &SessionConfig::default(), |_| ()).await?;

    session.subscribe(Counter::default())?;
    assert!(matches!(
        session.subscribe(Counter::default()),
        Err(SessionError::AlreadySubscribed)
    ));

    Ok(())
}

#[tokio::test]
async fn descriptions_of_the_wrong_kind_are_refused() -> Result<()> {
    let engine = MockEngine::new();
    let config = SessionConfig::default();

    let offerer = Session::create_offer(&engine, &config, |_| ()).await?;
    let offer = offerer.local_description().context("offer not committed")?;

    assert!(matches!(
        offerer.apply_answer(offer.clone()).await,
        Err(NegotiationError::InvalidDescription(SdpType::Offer))
    ));

    assert!(matches!(
        Session::create_answer(&engine, &config, |_| (), SessionDescription::answer("v=0")).await,
        Err(NegotiationError::InvalidDescription(SdpType::Answer))
    ));

    let answerer = Session::create_answer(&engine, &config, |_| (), offer).await?;
    let answer = answerer.local_description().context("answer not committed")?;
    assert_eq!(answerer.state(), SessionState::DescriptionExchanged);

    assert!(matches!(
        answerer.apply_answer(answer.clone()).await,
        Err(NegotiationError::InvalidState(_))
    ));

    offerer.apply_answer(answer.clone()).await?;
    assert_eq!(offerer.state(), SessionState::DescriptionExchanged);

    assert!(matches!(
        offerer.apply_answer(answer).await,
        Err(NegotiationError::InvalidState(_))
    ));

    Ok(())
}

#[tokio::test]
async fn engine_errors_release_the_session() -> Result<()> {
    let engine = MockEngine::new();
    let config = SessionConfig::default();

    engine.inject(Fault::CreateOffer);
    assert!(matches!(
        Session::create_offer(&engine, &config, |_| ()).await,
        Err(NegotiationError::Engine(_))
    ));

    assert_eq!(engine.live_connections(), 0);
    engine.clear(Fault::CreateOffer);

    let offerer = Session::create_offer(&engine, &config, |_| ()).await?;
    let offer = offerer.local_description().context("offer not committed")?;
    let answerer = Session::create_answer(&engine, &config, |_| (), offer).await?;

    let events = Counter::default();
    offerer.subscribe(events.clone())?;

    engine.inject(Fault::SetRemoteDescription);
    let answer = answerer.local_description().context("answer not committed")?;
    assert!(offerer.apply_answer(answer).await.is_err());

    assert_eq!(offerer.state(), SessionState::Failed);
    wait_until("failed", || events.failed() == 1).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_remote_channel_fails_the_answerer() -> Result<()> {
    let engine = MockEngine::new();
    let wide = SessionConfig {
        channels: vec![Reliability::Reliable; 3],
        ..SessionConfig::default()
    };

    let offerer = Session::create_offer(&engine, &wide, |_| ()).await?;
    let offer = offerer.local_description().context("offer not committed")?;

    let answerer = Session::create_answer(&engine, &SessionConfig::default(), |_| (), offer).await?;
    let events = Counter::default();
    answerer.subscribe(events.clone())?;

    let answer = answerer.local_description().context("answer not committed")?;
    offerer.apply_answer(answer).await?;

    wait_until("failed", || events.failed() == 1).await?;
    assert_eq!(answerer.state(), SessionState::Failed);
    Ok(())
}

#[tokio::test]
async fn connection_failure_fails_the_session() -> Result<()> {
    let engine = MockEngine::new();
    let session = Session::create_offer(&engine, &SessionConfig::default(), |_| ()).await?;

    let events = Counter::default();
    session.subscribe(events.clone())?;

    session.connection().emit_connection_state(ConnectionState::Failed);
    wait_until("failed", || events.failed() == 1).await?;
    assert_eq!(session.state(), SessionState::Failed);

    session.connection().emit_connection_state(ConnectionState::Failed);
    settle().await;
    assert_eq!(events.failed(), 1);
    Ok(())
}

#[tokio::test]
async fn display_lists_every_channel() -> Result<()> {
    let engine = MockEngine::new();
    let session = Session::create_offer(&engine, &SessionConfig::default(), |_| ()).await?;

    assert_eq!(
        session.to_string(),
        format!("Session #{} (Idle)\n- 0: Connecting\n- 1: Connecting", session.id())
    );

    Ok(())
}
