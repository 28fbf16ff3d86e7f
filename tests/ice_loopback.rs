// tests/ice_loopback.rs
//! End-to-end ICE sessions between two agents on 127.0.0.1
//!
//! Every agent carries a "video" and an "audio" stream with two components
//! each, gathered on the loopback address only.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::info;

use sharp_ice::nat::error::IceResult;
use sharp_ice::nat::ice::{
    CandidateType, IceAgent, IceConfig, IceEvent, IceRole, IceSocket, IceStatus, NominationMode,
    SessionDescription,
};

/// Test logging setup
fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

fn loopback_config(nomination: NominationMode) -> IceConfig {
    IceConfig {
        host_addresses: vec!["127.0.0.1".parse().unwrap()],
        nomination,
        ..IceConfig::local_only()
    }
}

async fn peer(role: IceRole, nomination: NominationMode) -> IceResult<IceAgent> {
    IceAgent::builder(role)
        .config(loopback_config(nomination))
        .socket(IceSocket::new("video", 2))
        .socket(IceSocket::new("audio", 2))
        .build()
        .await
}

/// Exchange descriptions through their text form and start both agents
async fn connect(a: &IceAgent, b: &IceAgent) -> IceResult<()> {
    let offer: SessionDescription = a.local_description().to_string().parse()?;
    let answer: SessionDescription = b.local_description().to_string().parse()?;
    b.set_remote(&offer)?;
    a.set_remote(&answer)?;
    a.start()?;
    b.start()?;
    Ok(())
}

async fn wait_both(a: &IceAgent, b: &IceAgent, limit: Duration) -> (IceStatus, IceStatus) {
    timeout(limit, async { tokio::join!(a.wait_for_completion(), b.wait_for_completion()) })
        .await
        .expect("agents did not finish in time")
}

/// Both sides selected mirror-image pairs for every component
fn assert_selected_pairs_match(a: &IceAgent, b: &IceAgent) {
    let pairs_a = a.selected_pairs();
    let pairs_b = b.selected_pairs();
    assert_eq!(pairs_a.len(), 4);
    assert_eq!(pairs_b.len(), 4);

    for pa in &pairs_a {
        let pb = pairs_b
            .iter()
            .find(|p| p.stream == pa.stream && p.component == pa.component)
            .expect("component missing on the other side");
        assert_eq!(pa.local.addr(), pb.remote.addr());
        assert_eq!(pa.remote.addr(), pb.local.addr());
        assert_eq!(pa.priority, pb.priority);
    }
}

async fn assert_data_flows(a: &IceAgent, b: &IceAgent) {
    let sender = a.channel(0, 1).unwrap();
    let receiver = b.channel(0, 1).unwrap();
    let mut listener = receiver.add_listener();

    let written = sender.write(b"Testing").unwrap();
    assert_eq!(written, 7);

    let (from, data) = timeout(Duration::from_secs(5), receiver.receive())
        .await
        .expect("datagram not delivered")
        .unwrap();
    assert_eq!(&data[..], b"Testing");
    assert_eq!(from, a.nominated(0, 1).unwrap().local.addr());

    let event = timeout(Duration::from_secs(1), listener.recv()).await.unwrap().unwrap();
    assert!(matches!(event, IceEvent::BytesAvailable { stream: 0, component: 1, .. }));
}

#[tokio::test]
async fn test_regular_nomination_end_to_end() -> IceResult<()> {
    setup_test_logging();
    let a = peer(IceRole::Controlling, NominationMode::Regular).await?;
    let b = peer(IceRole::Controlled, NominationMode::Regular).await?;
    let mut events = a.subscribe();

    connect(&a, &b).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ne!(a.status(), IceStatus::NotStarted);
    assert_ne!(b.status(), IceStatus::NotStarted);
    assert_eq!(
        events.try_recv(),
        Some(IceEvent::StateChanged { old: IceStatus::NotStarted, new: IceStatus::InProgress })
    );

    let (status_a, status_b) = wait_both(&a, &b, Duration::from_secs(60)).await;
    assert_eq!(status_a, IceStatus::Success);
    assert_eq!(status_b, IceStatus::Success);
    assert_selected_pairs_match(&a, &b);
    assert_data_flows(&a, &b).await;

    // One NominationComplete per component on the controlling side
    let mut nominations = 0;
    while let Some(event) = events.try_recv() {
        if matches!(event, IceEvent::NominationComplete { .. }) {
            nominations += 1;
        }
    }
    assert_eq!(nominations, 4);
    assert_eq!(a.role(), IceRole::Controlling);
    assert_eq!(b.role(), IceRole::Controlled);

    // Ordinary checks go out plain; only the nomination checks carry USE-CANDIDATE
    let stats = a.stats();
    assert!(stats.use_candidate_checks >= 4);
    assert!(stats.use_candidate_checks < stats.checks_sent);
    assert_eq!(b.stats().use_candidate_checks, 0);

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn test_aggressive_nomination_end_to_end() -> IceResult<()> {
    setup_test_logging();
    let a = peer(IceRole::Controlling, NominationMode::Aggressive).await?;
    let b = peer(IceRole::Controlled, NominationMode::Aggressive).await?;
    let mut events = a.subscribe();

    connect(&a, &b).await?;
    let (status_a, status_b) = wait_both(&a, &b, Duration::from_secs(30)).await;
    assert_eq!(status_a, IceStatus::Success);
    assert_eq!(status_b, IceStatus::Success);
    assert_selected_pairs_match(&a, &b);
    assert_data_flows(&a, &b).await;

    // Every controlling check nominates; there is no separate nomination round
    let stats = a.stats();
    assert!(stats.checks_sent > 0);
    assert_eq!(stats.use_candidate_checks, stats.checks_sent);
    assert_eq!(b.stats().use_candidate_checks, 0);

    let mut nominations = 0;
    while let Some(event) = events.try_recv() {
        if matches!(event, IceEvent::NominationComplete { .. }) {
            nominations += 1;
        }
    }
    assert_eq!(nominations, 4);

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn test_role_conflict_resolved_by_tie_breaker() -> IceResult<()> {
    setup_test_logging();
    let a = peer(IceRole::Controlling, NominationMode::Regular).await?;
    let b = peer(IceRole::Controlling, NominationMode::Regular).await?;

    connect(&a, &b).await?;
    let (status_a, status_b) = wait_both(&a, &b, Duration::from_secs(60)).await;
    assert_eq!(status_a, IceStatus::Success);
    assert_eq!(status_b, IceStatus::Success);

    let (winner, loser) = if a.tie_breaker() > b.tie_breaker() { (&a, &b) } else { (&b, &a) };
    info!("winner tie-breaker {:#x}, loser {:#x}", winner.tie_breaker(), loser.tie_breaker());
    assert_eq!(winner.role(), IceRole::Controlling);
    assert_eq!(loser.role(), IceRole::Controlled);
    assert_eq!(winner.stats().role_switches, 0);
    assert_eq!(loser.stats().role_switches, 1);
    assert_selected_pairs_match(&a, &b);

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn test_larger_tie_breaker_always_keeps_control() -> IceResult<()> {
    setup_test_logging();

    async fn one_run() -> IceResult<bool> {
        let config = loopback_config(NominationMode::Regular);
        let a = IceAgent::create_peer(IceRole::Controlling, None, false, vec![IceSocket::new("data", 1)], config.clone()).await?;
        let b = IceAgent::create_peer(IceRole::Controlling, None, false, vec![IceSocket::new("data", 1)], config).await?;
        connect(&a, &b).await?;
        let (sa, sb) = wait_both(&a, &b, Duration::from_secs(30)).await;

        let expected = if a.tie_breaker() > b.tie_breaker() {
            (IceRole::Controlling, IceRole::Controlled)
        } else {
            (IceRole::Controlled, IceRole::Controlling)
        };
        let ok = sa == IceStatus::Success && sb == IceStatus::Success && (a.role(), b.role()) == expected;
        a.close();
        b.close();
        Ok(ok)
    }

    for batch in 0..10 {
        let results = join_all((0..10).map(|_| one_run())).await;
        for (i, result) in results.into_iter().enumerate() {
            assert!(result?, "run {} of batch {} ended with the wrong roles", i, batch);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_lite_peer_is_checked_by_full_agent() -> IceResult<()> {
    setup_test_logging();
    let full = peer(IceRole::Controlled, NominationMode::Regular).await?;
    let lite = IceAgent::builder(IceRole::Controlling)
        .lite(true)
        .config(loopback_config(NominationMode::Regular))
        .socket(IceSocket::new("video", 2))
        .socket(IceSocket::new("audio", 2))
        .build()
        .await?;

    connect(&full, &lite).await?;
    assert_eq!(full.remote_is_lite(), Some(true));
    assert_eq!(lite.remote_is_lite(), Some(false));
    assert_eq!(full.role(), IceRole::Controlling);
    assert_eq!(lite.role(), IceRole::Controlled);

    let (status_full, status_lite) = wait_both(&full, &lite, Duration::from_secs(30)).await;
    assert_eq!(status_full, IceStatus::Success);
    assert_eq!(status_lite, IceStatus::Success);
    assert_selected_pairs_match(&full, &lite);
    assert_eq!(lite.stats().checks_sent, 0);

    full.close();
    lite.close();
    Ok(())
}

#[tokio::test]
async fn test_unreachable_peer_fails() -> IceResult<()> {
    setup_test_logging();
    let config = IceConfig {
        rto_ms: 20,
        rc: 2,
        rm: 2,
        ..loopback_config(NominationMode::Regular)
    };
    let a = IceAgent::create_peer(IceRole::Controlling, None, false, vec![IceSocket::new("data", 1)], config.clone()).await?;
    let b = IceAgent::create_peer(IceRole::Controlled, None, false, vec![IceSocket::new("data", 1)], config).await?;
    let remote = b.local_description();
    b.close();

    a.set_remote(&remote)?;
    a.start()?;
    let status = timeout(Duration::from_secs(10), a.wait_for_completion()).await.unwrap();
    assert_eq!(status, IceStatus::Failed);
    assert!(a.selected_pairs().is_empty());
    assert!(a.stats().checks_failed >= 1);
    Ok(())
}

#[tokio::test]
async fn test_controlled_side_starting_after_controlling_finished() -> IceResult<()> {
    setup_test_logging();
    let config = loopback_config(NominationMode::Regular);
    let a = IceAgent::create_peer(IceRole::Controlling, None, false, vec![IceSocket::new("data", 1)], config.clone()).await?;
    let b = IceAgent::create_peer(IceRole::Controlled, None, false, vec![IceSocket::new("data", 1)], config).await?;

    // B answers checks, nomination included, before it knows anything about A
    a.set_remote(&b.local_description())?;
    a.start()?;
    let status = timeout(Duration::from_secs(10), a.wait_for_completion())
        .await
        .expect("controlling side did not finish");
    assert_eq!(status, IceStatus::Success);
    assert_eq!(b.status(), IceStatus::NotStarted);

    b.set_remote(&a.local_description())?;
    b.start()?;
    let status = timeout(Duration::from_secs(10), b.wait_for_completion())
        .await
        .expect("controlled side never completed");
    assert_eq!(status, IceStatus::Success);

    let pa = a.nominated(0, 1).expect("controlling side has no selected pair");
    let pb = b.nominated(0, 1).expect("controlled side has no selected pair");
    assert_eq!(pa.local.addr(), pb.remote.addr());
    assert_eq!(pa.remote.addr(), pb.local.addr());
    // The sender was already signalled, so no peer reflexive duplicate remains
    assert_eq!(b.remote_candidates(0).len(), 1);

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn test_peer_reflexive_remote_learned_from_inbound_check() -> IceResult<()> {
    setup_test_logging();
    let config = loopback_config(NominationMode::Regular);
    let a = IceAgent::create_peer(IceRole::Controlling, None, false, vec![IceSocket::new("data", 1)], config.clone()).await?;
    let b = IceAgent::create_peer(IceRole::Controlled, None, false, vec![IceSocket::new("data", 1)], config).await?;
    let a_addr = a.local_candidates(0)[0].addr();

    a.set_remote(&b.local_description())?;
    a.start()?;

    // A's checks reach B before B has any remote candidate
    let learned = timeout(Duration::from_secs(10), async {
        loop {
            if let Some(c) = b.remote_candidates(0).into_iter().find(|c| c.typ == CandidateType::PeerReflexive) {
                return c;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no peer reflexive candidate learned");
    assert_eq!(learned.addr(), a_addr);

    // Credentials only; the learned candidate is the sole remote
    let (ufrag, pwd) = a.local_credentials();
    b.set_remote_candidates(&ufrag, &pwd, false, vec![Vec::new()])?;
    b.start()?;

    let (status_a, status_b) = wait_both(&a, &b, Duration::from_secs(10)).await;
    assert_eq!(status_a, IceStatus::Success);
    assert_eq!(status_b, IceStatus::Success);

    let selected = b.nominated(0, 1).expect("controlled side has no selected pair");
    assert_eq!(selected.remote.typ, CandidateType::PeerReflexive);
    assert_eq!(selected.remote.addr(), a_addr);
    assert_eq!(a.nominated(0, 1).unwrap().remote.addr(), selected.local.addr());

    a.close();
    b.close();
    Ok(())
}
