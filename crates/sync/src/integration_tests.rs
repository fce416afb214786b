//! End-to-end tests through `CountEngine`.
//!
//! Covers the submission scenarios (first count, cross-team SUM/REPLACE,
//! same-team recount), two engines converging through the scheduler, session
//! lifecycle and the SQLite backend.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tally_core::{SessionId, TeamId};
    use tally_counting::{
        ActionType, ConflictPolicy, ItemSeed, LineFilter, NewSession, NewTeam, net_change,
    };
    use tally_infra::{InMemoryConnector, InMemoryStorage, SqliteConnector, StorageConnector};

    use crate::{
        CountEngine, CountError, CountSubmission, CycleOutcome, EngineConfig, SnapshotOrigin,
        SubmitOutcome,
    };

    fn test_config() -> EngineConfig {
        EngineConfig {
            retry_backoff_ms: 1,
            acquire_timeout_ms: 1_000,
            ..EngineConfig::default()
        }
    }

    fn test_seeds() -> Vec<ItemSeed> {
        vec![
            ItemSeed::new("x-1", "Hex bolt M8", 12.0).with_line("HARDWARE"),
            ItemSeed::new("Y-2", "Washer 8mm", 40.0).with_line("HARDWARE"),
            ItemSeed::new("Z-3", "Paint white 1L", 0.0).with_line("PAINT"),
        ]
    }

    struct Setup<C: StorageConnector> {
        engine: CountEngine<C>,
        session: SessionId,
        team_a: TeamId,
        team_b: TeamId,
    }

    async fn setup_with<C: StorageConnector>(connector: C) -> Setup<C> {
        setup_with_config(connector, test_config()).await
    }

    async fn setup_with_config<C: StorageConnector>(connector: C, config: EngineConfig) -> Setup<C> {
        let engine = CountEngine::new(connector, config).unwrap();
        let session = engine
            .start_session(NewSession::named("March cut"), &test_seeds())
            .await
            .unwrap()
            .id;
        let team_a = engine
            .register_team(NewTeam::new("Team A", ["ana", "luis"]))
            .await
            .unwrap()
            .id;
        let team_b = engine
            .register_team(NewTeam::new("Team B", ["marta"]))
            .await
            .unwrap()
            .id;
        Setup {
            engine,
            session,
            team_a,
            team_b,
        }
    }

    async fn setup() -> (InMemoryStorage, Setup<InMemoryConnector>) {
        let storage = InMemoryStorage::new();
        let setup = setup_with(storage.connector()).await;
        (storage, setup)
    }

    async fn submit<C: StorageConnector>(
        engine: &CountEngine<C>,
        submission: CountSubmission,
    ) -> SubmitOutcome {
        engine.submit(submission).await.unwrap()
    }

    fn committed_count(outcome: SubmitOutcome) -> f64 {
        match outcome {
            SubmitOutcome::Committed(c) => c.item.physical_count,
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cross_team_sum() {
        let (_storage, s) = setup().await;

        let first = submit(&s.engine, CountSubmission::new("X-1", s.team_a, 10.0)).await;
        assert_eq!(committed_count(first), 10.0);

        let conflict = match submit(&s.engine, CountSubmission::new("X-1", s.team_b, 5.0)).await {
            SubmitOutcome::PolicyRequired(c) => c,
            other => panic!("expected policy request, got {other:?}"),
        };
        assert_eq!(conflict.current_count, 10.0);
        assert_eq!(conflict.counted_by, Some(s.team_a));

        let summed = submit(
            &s.engine,
            CountSubmission::new("X-1", s.team_b, 5.0).with_policy(ConflictPolicy::Sum),
        )
        .await;
        assert_eq!(committed_count(summed), 15.0);

        let history = s.engine.history_for("x-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, ActionType::New);
        let last = &history[1];
        assert_eq!(
            (last.previous_quantity, last.resulting_quantity, last.action),
            (10.0, 15.0, ActionType::Sum)
        );
        assert_eq!(last.team_id, s.team_b);
        s.engine.verify_item("X-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_cross_team_replace() {
        let (_storage, s) = setup().await;
        submit(&s.engine, CountSubmission::new("X-1", s.team_a, 10.0)).await;
        let replaced = submit(
            &s.engine,
            CountSubmission::new("X-1", s.team_b, 5.0).with_policy(ConflictPolicy::Replace),
        )
        .await;
        assert_eq!(committed_count(replaced), 5.0);

        let history = s.engine.history_for("X-1").await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(
            (last.previous_quantity, last.resulting_quantity, last.action),
            (10.0, 5.0, ActionType::Replace)
        );
        assert_eq!(s.engine.snapshot().get("X-1").unwrap().difference(), -7.0);
        s.engine.verify_item("X-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_same_team_recount_overwrites() {
        let (_storage, s) = setup().await;
        submit(&s.engine, CountSubmission::new("Y-2", s.team_a, 38.0)).await;
        let recount = submit(&s.engine, CountSubmission::new("Y-2", s.team_a, 40.0)).await;
        assert_eq!(committed_count(recount), 40.0);

        let history = s.engine.history_for("Y-2").await.unwrap();
        assert!(history.iter().all(|e| e.action == ActionType::New));
        assert_eq!(net_change(&history), 40.0);

        let kpis = s.engine.kpis();
        assert_eq!((kpis.counted, kpis.exact), (1, 1));
    }

    #[tokio::test]
    async fn test_history_replays_to_current_count() {
        let (_storage, s) = setup().await;
        let steps = [
            (s.team_a, 4.0, None),
            (s.team_b, 3.0, Some(ConflictPolicy::Sum)),
            (s.team_b, 9.0, None),
            (s.team_a, 2.0, Some(ConflictPolicy::Replace)),
            (s.team_b, 6.5, Some(ConflictPolicy::Sum)),
        ];
        for (team, qty, policy) in steps {
            let mut submission = CountSubmission::new("X-1", team, qty);
            submission.policy = policy;
            submit(&s.engine, submission).await;
        }

        let item = s.engine.snapshot().get("X-1").cloned().unwrap();
        assert_eq!(item.physical_count, 8.5);
        let history = s.engine.history_for("X-1").await.unwrap();
        assert_eq!(history.len(), steps.len());
        assert_eq!(net_change(&history), item.physical_count);
        s.engine.verify_item("X-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_two_engines_converge_through_sync() {
        let storage = InMemoryStorage::new();
        let s = setup_with(storage.connector()).await;
        let other = CountEngine::new(storage.connector(), test_config()).unwrap();
        other.open_session(s.session).await.unwrap();
        let sub = other.subscribe();

        submit(&s.engine, CountSubmission::new("X-1", s.team_a, 10.0)).await;
        assert!(!other.snapshot().get("X-1").unwrap().is_counted());

        let report = match other.sync_now().await {
            CycleOutcome::Completed(r) => r,
            o => panic!("expected completed cycle, got {o:?}"),
        };
        assert_eq!(report.merge.applied, 1);
        assert_eq!(other.snapshot().get("X-1").unwrap().physical_count, 10.0);
        assert_eq!(report.kpis.counted, 1);
        let ready = sub.latest().unwrap();
        assert!(matches!(ready.origin, SnapshotOrigin::Sync { .. }));

        match submit(&other, CountSubmission::new("X-1", s.team_b, 2.0)).await {
            SubmitOutcome::PolicyRequired(c) => assert_eq!(c.current_count, 10.0),
            o => panic!("expected policy request, got {o:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_engine_rereads_before_overwriting() {
        let storage = InMemoryStorage::new();
        let s = setup_with(storage.connector()).await;
        let other = CountEngine::new(storage.connector(), test_config()).unwrap();
        other.open_session(s.session).await.unwrap();

        submit(&s.engine, CountSubmission::new("X-1", s.team_a, 10.0)).await;

        // `other` still believes X-1 is uncounted; the commit conflicts and
        // the re-read surfaces the cross-team count.
        match submit(&other, CountSubmission::new("X-1", s.team_b, 3.0)).await {
            SubmitOutcome::PolicyRequired(c) => assert_eq!(c.counted_by, Some(s.team_a)),
            o => panic!("expected policy request, got {o:?}"),
        }
        let summed = submit(
            &other,
            CountSubmission::new("X-1", s.team_b, 3.0).with_policy(ConflictPolicy::Sum),
        )
        .await;
        assert_eq!(committed_count(summed), 13.0);
        assert_eq!(storage.history_snapshot(s.session).len(), 2);
    }

    #[tokio::test]
    async fn test_commit_retries_are_bounded() {
        let (storage, s) = setup().await;
        storage.inject_version_conflicts(2);
        match submit(&s.engine, CountSubmission::new("X-1", s.team_a, 1.0)).await {
            SubmitOutcome::Committed(c) => assert_eq!(c.attempts, 3),
            o => panic!("expected commit, got {o:?}"),
        }

        storage.inject_version_conflicts(100);
        let err = s
            .engine
            .submit(CountSubmission::new("Y-2", s.team_a, 7.0))
            .await
            .unwrap_err();
        match err {
            CountError::FatalSync {
                item_code,
                quantity,
                ..
            } => {
                assert_eq!(item_code.as_deref(), Some("Y-2"));
                assert_eq!(quantity, Some(7.0));
            }
            other => panic!("expected fatal sync, got {other:?}"),
        }
        assert!(!s.engine.snapshot().get("Y-2").unwrap().is_counted());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let (_storage, s) = setup().await;
        for submission in [
            CountSubmission::new("X-1", s.team_a, -1.0),
            CountSubmission::new("X-1", s.team_a, f64::NAN),
            CountSubmission::new("NOPE", s.team_a, 1.0),
            CountSubmission::new("   ", s.team_a, 1.0),
        ] {
            let err = s.engine.submit(submission).await.unwrap_err();
            assert!(matches!(err, CountError::Validation(_)), "got {err:?}");
        }
        assert!(matches!(
            s.engine
                .register_team(NewTeam::new("Team A", ["dup"]))
                .await
                .unwrap_err(),
            CountError::Storage(_)
        ));
    }

    #[tokio::test]
    async fn test_extra_item_is_countable() {
        let (_storage, s) = setup().await;
        let item = s
            .engine
            .add_extra_item(" w-9 ", "Unlabelled crate", None)
            .await
            .unwrap();
        assert_eq!(item.code, "W-9");
        assert_eq!(item.line, "UNASSIGNED");
        assert_eq!(item.system_stock, 0.0);

        assert!(s.engine.add_extra_item("W-9", "Again", None).await.is_err());

        let counted = submit(&s.engine, CountSubmission::new("W-9", s.team_a, 2.0)).await;
        assert_eq!(committed_count(counted), 2.0);
        assert_eq!(s.engine.kpis().overages, 1);
    }

    #[tokio::test]
    async fn test_system_stock_refresh_keeps_counts() {
        let (_storage, s) = setup().await;
        submit(&s.engine, CountSubmission::new("X-1", s.team_a, 10.0)).await;

        let stock = HashMap::from([("x-1".to_string(), 10.0), ("Z-3".to_string(), 5.0)]);
        let touched = s.engine.refresh_system_stock(&stock).await.unwrap();
        assert_eq!(touched, 3);

        let snapshot = s.engine.snapshot();
        let x = snapshot.get("X-1").unwrap();
        assert_eq!((x.system_stock, x.physical_count), (10.0, 10.0));
        assert_eq!(snapshot.get("Y-2").unwrap().system_stock, 0.0);
        assert_eq!(snapshot.get("Z-3").unwrap().system_stock, 5.0);

        let kpis = s.engine.kpis();
        assert_eq!((kpis.exact, kpis.total_with_stock), (1, 2));
    }

    #[tokio::test]
    async fn test_line_filter_scopes_kpis_and_report() {
        let (_storage, s) = setup().await;
        submit(&s.engine, CountSubmission::new("X-1", s.team_a, 11.0)).await;
        s.engine.set_line_filter(LineFilter::line("hardware"));
        assert_eq!(s.engine.kpis().total, 2);

        s.engine.request_refresh();
        let report = match s.engine.sync_now().await {
            CycleOutcome::Completed(r) => r,
            o => panic!("expected completed cycle, got {o:?}"),
        };
        assert!(report.heavy);
        assert_eq!(report.kpis.shortages, 1);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_storage, s) = setup().await;
        assert_eq!(s.engine.active_session_id(), Some(s.session));

        let closed = s.engine.close_session(s.session).await.unwrap();
        assert!(closed.is_closed());
        assert!(closed.ended_at.is_some());
        assert_eq!(s.engine.active_session_id(), None);
        assert!(s.engine.open_latest_session().await.unwrap().is_none());

        // Re-opening a closed session is read-only.
        s.engine.open_session(s.session).await.unwrap();
        let err = s
            .engine
            .submit(CountSubmission::new("X-1", s.team_a, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CountError::Validation(_)), "got {err:?}");
        assert!(s.engine.close_session(s.session).await.is_err());

        let next = s
            .engine
            .start_session(NewSession::named("April cut"), &test_seeds())
            .await
            .unwrap();
        let sessions = s.engine.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, next.id);
        assert_eq!(
            s.engine.open_latest_session().await.unwrap().map(|s| s.id),
            Some(next.id)
        );
    }

    #[tokio::test]
    async fn test_teams_can_be_deactivated() {
        let (_storage, s) = setup().await;
        let team = s.engine.deactivate_team(s.team_b).await.unwrap();
        assert!(!team.active);
        assert_eq!(s.engine.list_teams(false).await.unwrap().len(), 1);
        let all = s.engine.list_teams(true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].members, vec!["ANA", "LUIS"]);
    }

    #[tokio::test]
    async fn test_callbacks_receive_submission_snapshots() {
        let (_storage, s) = setup().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        s.engine.on_snapshot_ready(move |ready| {
            if ready.origin == SnapshotOrigin::Submission {
                seen_cb.fetch_add(ready.kpis.counted, Ordering::SeqCst);
            }
        });
        submit(&s.engine, CountSubmission::new("X-1", s.team_a, 1.0)).await;
        submit(&s.engine, CountSubmission::new("Y-2", s.team_a, 1.0)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1 + 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_the_pool() {
        let (_storage, s) = setup().await;
        s.engine.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.engine.shutdown().await.unwrap();
        let err = s
            .engine
            .submit(CountSubmission::new("X-1", s.team_a, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CountError::Connection(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_shutdown_drains_an_in_flight_commit() {
        let (storage, s) = setup().await;
        let engine = Arc::new(s.engine);
        storage.set_latency(Duration::from_millis(200));

        let submitting = Arc::clone(&engine);
        let team = s.team_a;
        let handle = tokio::spawn(async move {
            submitting.submit(CountSubmission::new("X-1", team, 4.0)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.shutdown().await.unwrap();
        let history = storage.history_snapshot(s.session);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resulting_quantity, 4.0);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(committed_count(outcome), 4.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_engines_racing_on_one_sqlite_item_keep_one_row_per_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        let config = EngineConfig {
            max_commit_retries: 50,
            ..test_config()
        };
        let s = setup_with_config(SqliteConnector::at_path(&path), config.clone()).await;
        let team_c = s
            .engine
            .register_team(NewTeam::new("Team C", ["pablo"]))
            .await
            .unwrap()
            .id;

        let mut stations = vec![(Arc::new(s.engine), s.team_a)];
        for team in [s.team_b, team_c] {
            let engine = CountEngine::new(SqliteConnector::at_path(&path), config.clone()).unwrap();
            engine.open_session(s.session).await.unwrap();
            stations.push((Arc::new(engine), team));
        }

        let mut handles = Vec::new();
        for (engine, team) in &stations {
            for _ in 0..7 {
                let engine = Arc::clone(engine);
                let team = *team;
                handles.push(tokio::spawn(async move {
                    engine
                        .submit(CountSubmission::new("X-1", team, 1.0).with_policy(ConflictPolicy::Sum))
                        .await
                }));
            }
        }

        let mut committed = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(SubmitOutcome::Committed(c)) => committed.push(c.entry.id),
                Ok(other) => panic!("a policy was supplied, got {other:?}"),
                Err(CountError::FatalSync { .. }) => {}
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert!(!committed.is_empty());

        let history = stations[0].0.history_for("X-1").await.unwrap();
        assert_eq!(history.len(), committed.len());
        for id in &committed {
            assert_eq!(history.iter().filter(|e| e.id == *id).count(), 1);
        }
        for (engine, _) in &stations {
            engine.verify_item("X-1").await.unwrap();
            engine.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sqlite_backend_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        let s = setup_with(SqliteConnector::at_path(&path)).await;

        submit(&s.engine, CountSubmission::new("X-1", s.team_a, 10.0)).await;
        submit(
            &s.engine,
            CountSubmission::new("X-1", s.team_b, 5.0).with_policy(ConflictPolicy::Sum),
        )
        .await;
        s.engine.verify_item("X-1").await.unwrap();
        s.engine.shutdown().await.unwrap();

        // A fresh engine on the same file picks the session back up.
        let reopened = CountEngine::new(SqliteConnector::at_path(&path), test_config()).unwrap();
        let session = reopened.open_latest_session().await.unwrap().unwrap();
        assert_eq!(session.id, s.session);
        let item = reopened.snapshot().get("X-1").cloned().unwrap();
        assert_eq!(item.physical_count, 15.0);
        assert_eq!(item.version, 2);
        assert_eq!(reopened.history_for("X-1").await.unwrap().len(), 2);
        reopened.shutdown().await.unwrap();
    }
}
