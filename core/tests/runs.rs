use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use ptyhub_core::ExitInfo;
use ptyhub_core::OwnerChannel;
use ptyhub_core::PtyHubError;
use ptyhub_core::SupervisorConfig;
use ptyhub_protocol::BroadcastEvent;
use ptyhub_protocol::RunOutcome;
use ptyhub_protocol::SessionEvent;
use ptyhub_protocol::StartLocalSessionParams;
use ptyhub_test_support::direct_params;
use ptyhub_test_support::local_params;
use ptyhub_test_support::next_broadcast;
use ptyhub_test_support::next_lifecycle_event;
use ptyhub_test_support::settle;
use ptyhub_test_support::start_supervisor;
use tokio::sync::broadcast;

async fn next_run_finished(
    rx: &mut broadcast::Receiver<BroadcastEvent>,
) -> anyhow::Result<(String, RunOutcome, u64)> {
    loop {
        if let BroadcastEvent::RunFinished {
            key,
            outcome,
            duration_ms,
        } = next_broadcast(rx).await?
        {
            return Ok((key, outcome, duration_ms));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn clean_cli_exit_is_accounted_and_notified_once() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    let mut broadcasts = sup.handle.subscribe();
    let (owner, mut rx) = OwnerChannel::new();
    sup.handle
        .start_direct(direct_params("claude:main:task-1", "claude"), &owner)
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    sup.factory.spawned(0)?.exit(ExitInfo::code(0));
    assert_matches!(next_lifecycle_event(&mut rx).await?, SessionEvent::Ready { .. });

    let (key, outcome, duration_ms) = next_run_finished(&mut broadcasts).await?;
    assert_eq!(key, "claude:task-1");
    assert_eq!(outcome, RunOutcome::Ok);
    assert!(duration_ms >= 5_000);
    assert_eq!(sup.notifier.session_ids(), vec!["claude:main:task-1".to_string()]);

    // Killing the shell that took over finalizes nothing a second time.
    sup.handle.kill("claude:main:task-1").await?;
    settle().await;
    assert_eq!(sup.notifier.session_ids().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failing_and_signaled_exits_are_not_notified() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    let mut broadcasts = sup.handle.subscribe();
    let (owner, mut rx) = OwnerChannel::new();

    sup.handle
        .start_direct(direct_params("codex:main:a", "codex"), &owner)
        .await?;
    sup.factory.spawned(0)?.exit(ExitInfo::code(2));
    assert_matches!(next_lifecycle_event(&mut rx).await?, SessionEvent::Ready { .. });
    let (_, outcome, _) = next_run_finished(&mut broadcasts).await?;
    assert_eq!(outcome, RunOutcome::Error);

    sup.handle
        .start_direct(direct_params("codex:main:b", "codex"), &owner)
        .await?;
    sup.factory.last_spawn()?.exit(ExitInfo {
        exit_code: Some(1),
        signal: Some("SIGINT".to_string()),
    });
    assert_matches!(next_lifecycle_event(&mut rx).await?, SessionEvent::Ready { .. });
    let (key, outcome, _) = next_run_finished(&mut broadcasts).await?;
    assert_eq!(key, "codex:b");
    assert_eq!(outcome, RunOutcome::Interrupted);

    assert!(sup.notifier.session_ids().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_zero_exit_after_manual_kill_is_not_notified() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    sup.factory.ignore_terminate(true);
    let (owner, mut rx) = OwnerChannel::new();
    sup.handle
        .start_direct(direct_params("claude:main:t1", "claude"), &owner)
        .await?;

    sup.handle.kill("claude:main:t1").await?;
    assert_eq!(
        next_lifecycle_event(&mut rx).await?,
        SessionEvent::Exit {
            session_id: "claude:main:t1".to_string(),
            exit_code: None,
            signal: None,
        }
    );

    let cli = sup.factory.spawned(0)?;
    cli.exit(ExitInfo::code(0));
    settle().await;

    assert!(sup.notifier.session_ids().is_empty());
    assert_eq!(cli.log().terminate_calls, 1);
    assert_eq!(sup.factory.spawn_count(), 1);
    assert!(sup.handle.list_sessions().await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_zero_exit_of_killed_agent_shell_is_not_notified() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    sup.factory.ignore_terminate(true);
    let mut broadcasts = sup.handle.subscribe();
    let (owner, mut rx) = OwnerChannel::new();
    sup.handle
        .start_local(
            StartLocalSessionParams {
                provider: Some("claude".to_string()),
                ..local_params("claude:main:task-1")
            },
            &owner,
        )
        .await?;
    tokio::time::advance(Duration::from_secs(3)).await;

    sup.handle.kill("claude:main:task-1").await?;
    assert_matches!(
        next_lifecycle_event(&mut rx).await?,
        SessionEvent::Exit { exit_code: None, .. }
    );

    let shell = sup.factory.spawned(0)?;
    shell.exit(ExitInfo::code(0));
    settle().await;
    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;

    assert!(sup.notifier.session_ids().is_empty());
    assert_eq!(shell.log().force_kill_calls, 0);
    while let Ok(event) = broadcasts.try_recv() {
        assert!(
            !matches!(event, BroadcastEvent::RunFinished { .. }),
            "unexpected {event:?}"
        );
    }
    assert!(sup.handle.list_sessions().await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn releasing_an_owner_kills_its_sessions_quietly() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    let (owner, mut rx) = OwnerChannel::new();
    let (other, _other_rx) = OwnerChannel::new();
    sup.handle
        .start_direct(direct_params("claude:main:t1", "claude"), &owner)
        .await?;
    sup.handle
        .start_local(local_params("shell:main:t2"), &other)
        .await?;

    assert_eq!(sup.handle.release_owner(owner.id()).await?, 1);
    assert_matches!(
        next_lifecycle_event(&mut rx).await?,
        SessionEvent::Exit { exit_code: None, .. }
    );
    settle().await;

    assert!(sup.notifier.session_ids().is_empty());
    assert_eq!(sup.factory.spawned(0)?.log().terminate_calls, 1);
    let remaining = sup.handle.list_sessions().await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, "shell:main:t2");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_kills_everything_without_notifying() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    let (owner, _rx) = OwnerChannel::new();
    sup.handle
        .start_direct(direct_params("claude:main:t1", "claude"), &owner)
        .await?;
    sup.handle
        .start_local(local_params("shell:main:t2"), &owner)
        .await?;

    sup.handle.shutdown().await?;

    assert!(sup.notifier.session_ids().is_empty());
    assert_eq!(sup.factory.spawned(0)?.log().terminate_calls, 1);
    assert_eq!(sup.factory.spawned(1)?.log().terminate_calls, 1);
    assert_matches!(
        sup.handle
            .start_local(local_params("shell:main:t3"), &owner)
            .await,
        Err(PtyHubError::SupervisorGone)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn only_agent_shells_are_timed() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    let (owner, mut rx) = OwnerChannel::new();

    sup.handle
        .start_local(local_params("shell:main:plain"), &owner)
        .await?;
    sup.factory.spawned(0)?.exit(ExitInfo::code(0));
    assert_matches!(next_lifecycle_event(&mut rx).await?, SessionEvent::Exit { .. });
    assert!(sup.notifier.session_ids().is_empty());

    let params = StartLocalSessionParams {
        provider: Some("claude".to_string()),
        ..local_params("claude:main:hinted")
    };
    sup.handle.start_local(params, &owner).await?;
    let hinted = sup.factory.spawned(1)?;
    assert_eq!(
        hinted.request.config.args.last().map(String::as_str),
        Some("claude; exec /bin/bash -l")
    );
    hinted.exit(ExitInfo::code(0));
    assert_matches!(next_lifecycle_event(&mut rx).await?, SessionEvent::Exit { .. });
    assert_eq!(sup.notifier.session_ids(), vec!["claude:main:hinted".to_string()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restart_after_kill_is_accounted_afresh() -> anyhow::Result<()> {
    let sup = start_supervisor(SupervisorConfig::default());
    let (owner, mut rx) = OwnerChannel::new();
    sup.handle
        .start_direct(direct_params("gemini:main:t1", "gemini"), &owner)
        .await?;
    sup.handle.kill("gemini:main:t1").await?;
    assert_matches!(next_lifecycle_event(&mut rx).await?, SessionEvent::Exit { .. });

    let restarted = sup
        .handle
        .start_direct(direct_params("gemini:main:t1", "gemini"), &owner)
        .await?;
    assert!(!restarted.reused);
    sup.factory.spawned(1)?.exit(ExitInfo::code(0));
    assert_matches!(next_lifecycle_event(&mut rx).await?, SessionEvent::Ready { .. });

    let records = sup.notifier.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].as_ref().map(|record| record.key.to_string()),
        Some("gemini:t1".to_string())
    );
    Ok(())
}
