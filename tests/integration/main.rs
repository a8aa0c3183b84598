//! Integration tests for workcache

mod support {
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use workcache::config::Settings;
    use workcache::{
        ArtifactCacheProvider, BuildSession, CapturedFailure, Identity, IdentityHasher,
        InputFingerprint, UnitOfWork, WorkspaceServices,
    };

    /// Work writing one file, with a shared run counter
    pub struct Compile {
        pub name: &'static str,
        pub source: &'static str,
        pub output: &'static str,
        pub failure: Option<&'static str>,
        pub delay: Duration,
        pub runs: Arc<AtomicUsize>,
    }

    impl Compile {
        pub fn new(name: &'static str, source: &'static str, output: &'static str) -> Self {
            Self {
                name,
                source,
                output,
                failure: None,
                delay: Duration::ZERO,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn failing(mut self, message: &'static str) -> Self {
            self.failure = Some(message);
            self
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn sharing(mut self, runs: &Arc<AtomicUsize>) -> Self {
            self.runs = Arc::clone(runs);
            self
        }

        pub fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UnitOfWork for Compile {
        fn identity(&self) -> Identity {
            IdentityHasher::new()
                .implementation("compile-1")
                .input("task", self.name)
                .identity()
        }

        fn input_fingerprint(&self) -> InputFingerprint {
            IdentityHasher::new().input("source", self.source).fingerprint()
        }

        fn display_name(&self) -> String {
            format!(":{}", self.name)
        }

        async fn execute(&self, workspace: &Path) -> Result<Vec<PathBuf>, CapturedFailure> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(message) = self.failure {
                return Err(CapturedFailure::new(message));
            }
            tokio::fs::write(workspace.join(self.output), self.source)
                .await
                .map_err(|e| CapturedFailure::from_error(&e))?;
            Ok(vec![PathBuf::from(self.output)])
        }
    }

    pub fn settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.cache.root = Some(root.to_path_buf());
        settings.cache.lock_timeout_secs = 10;
        settings.cache.lock_poll_millis = 5;
        settings.cache.producer_version = "1.0.0".to_string();
        settings
    }

    /// One "process": its own provider, session and identity cache
    pub async fn open(root: &Path) -> (WorkspaceServices, BuildSession) {
        let provider = ArtifactCacheProvider::open(&settings(root)).await.unwrap();
        let session = BuildSession::new();
        let provider = Arc::new(provider);
        session.add_listener(provider.cleanup_listener());
        let services = WorkspaceServices::new(provider, &session);
        (services, session)
    }

    pub fn temp_root() -> TempDir {
        TempDir::new().unwrap()
    }
}

mod scenarios {
    use crate::support::{open, temp_root, Compile};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use workcache::cache::{WorkspaceState, COMPLETION_MARKER};
    use workcache::{CapturedFailure, ExecutionOutcome, UnitOfWork};

    #[tokio::test]
    async fn first_result_wins_within_build() {
        let temp = temp_root();
        let (services, _session) = open(temp.path()).await;
        let f1 = Compile::new("jar", "v1", "out1.txt");
        let f2 = Compile::new("jar", "v1", "out2.txt");

        let first = services.execute(&f1).await.unwrap();
        let second = services.execute(&f2).await.unwrap();

        assert_eq!(first, second);
        let outputs = second.outputs().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].ends_with("out1.txt"));
        assert_eq!(f1.runs(), 1);
        assert_eq!(f2.runs(), 0);
    }

    #[tokio::test]
    async fn cached_failure_is_replayed() {
        let temp = temp_root();
        let (services, _session) = open(temp.path()).await;
        let broken = Compile::new("lint", "bad", "report.txt").failing("E");
        let fixed = Compile::new("lint", "bad", "report.txt");

        let first = services.execute(&broken).await.unwrap();
        let second = services.execute(&fixed).await.unwrap();

        assert_eq!(first, ExecutionOutcome::Failure(CapturedFailure::new("E")));
        assert_eq!(second, first);
        assert_eq!(fixed.runs(), 0);
    }

    #[tokio::test]
    async fn root_build_completion_clears_memory() {
        let temp = temp_root();
        let (services, session) = open(temp.path()).await;
        let broken = Compile::new("lint", "src", "report.txt").failing("E");
        let fixed = Compile::new("lint", "src", "report.txt");

        session.root_build_started().await;
        services.execute(&broken).await.unwrap();
        let result: Result<(), String> = session.root_build_completed(Err("build failed".into())).await;
        assert_eq!(result, Err("build failed".to_string()));
        assert!(services.identity_cache().is_empty());

        session.root_build_started().await;
        let outcome = services.execute(&fixed).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(fixed.runs(), 1);
    }

    #[tokio::test]
    async fn restart_reuses_workspace() {
        let temp = temp_root();
        let first_run = Compile::new("compile", "fn main() {}", "main.o");
        {
            let (services, session) = open(temp.path()).await;
            services.execute(&first_run).await.unwrap();
            session.root_build_completed(()).await;
        }

        let (services, _session) = open(temp.path()).await;
        let second_run = Compile::new("compile", "fn main() {}", "main.o");
        let outcome = services.execute(&second_run).await.unwrap();

        assert_eq!(second_run.runs(), 0);
        let outputs = outcome.outputs().unwrap();
        assert_eq!(std::fs::read_to_string(&outputs[0]).unwrap(), "fn main() {}");
    }

    #[tokio::test]
    async fn changed_inputs_recompute() {
        let temp = temp_root();
        {
            let (services, _session) = open(temp.path()).await;
            services
                .execute(&Compile::new("compile", "v1", "main.o"))
                .await
                .unwrap();
        }

        let (services, _session) = open(temp.path()).await;
        let changed = Compile::new("compile", "v2", "main.o");
        let outcome = services.execute(&changed).await.unwrap();

        assert_eq!(changed.runs(), 1);
        let outputs = outcome.outputs().unwrap();
        assert_eq!(std::fs::read_to_string(&outputs[0]).unwrap(), "v2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_processes_recreate_stale_workspace_once() {
        let temp = temp_root();
        let (a, _session_a) = open(temp.path()).await;
        let (b, _session_b) = open(temp.path()).await;

        let runs = Arc::new(AtomicUsize::new(0));
        let work_a = Compile::new("assemble", "src", "app.bin")
            .slow(Duration::from_millis(100))
            .sharing(&runs);
        let work_b = Compile::new("assemble", "src", "app.bin")
            .slow(Duration::from_millis(100))
            .sharing(&runs);

        // Leftover of a crashed build: directory without completion marker
        let stale = a.workspace_store().workspace_dir(&work_a.identity());
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("app.bin"), "partial").unwrap();
        assert_eq!(
            a.workspace_store().state(&work_a.identity()).await,
            WorkspaceState::Building
        );

        let (outcome_a, outcome_b) = tokio::join!(a.execute(&work_a), b.execute(&work_b));
        let outcome_a = outcome_a.unwrap();
        let outcome_b = outcome_b.unwrap();

        assert_eq!(work_a.runs(), 1);
        assert_eq!(outcome_a, outcome_b);
        assert!(stale.join(COMPLETION_MARKER).is_file());
        assert_eq!(std::fs::read_to_string(stale.join("app.bin")).unwrap(), "src");
    }

    #[tokio::test]
    async fn failures_are_not_reused_across_builds() {
        let temp = temp_root();
        {
            let (services, _session) = open(temp.path()).await;
            services
                .execute(&Compile::new("test", "src", "results.xml").failing("E"))
                .await
                .unwrap();
        }

        let (services, _session) = open(temp.path()).await;
        let retry = Compile::new("test", "src", "results.xml");
        let outcome = services.execute(&retry).await.unwrap();

        assert_eq!(retry.runs(), 1);
        assert_eq!(
            outcome.outputs().map(|o| o.len()),
            Some(1),
            "retry should produce its outputs"
        );
    }

    #[tokio::test]
    async fn outputs_outside_workspace_fail() {
        use async_trait::async_trait;
        use std::path::Path;
        use workcache::{Identity, IdentityHasher, InputFingerprint};

        struct Escapes;

        #[async_trait]
        impl UnitOfWork for Escapes {
            fn identity(&self) -> Identity {
                IdentityHasher::new().input("task", "escapes").identity()
            }

            fn input_fingerprint(&self) -> InputFingerprint {
                IdentityHasher::new().fingerprint()
            }

            fn display_name(&self) -> String {
                "escapes".to_string()
            }

            async fn execute(&self, _workspace: &Path) -> Result<Vec<PathBuf>, CapturedFailure> {
                Ok(vec![PathBuf::from("/etc/passwd")])
            }
        }

        let temp = temp_root();
        let (services, _session) = open(temp.path()).await;

        let outcome = services.execute(&Escapes).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(
            services.workspace_store().state(&Escapes.identity()).await,
            WorkspaceState::Miss
        );
    }
}

mod logging_scope {
    use crate::support::{open, temp_root, Compile};
    use workcache::{run_with_logging_scope, CapturedOutput, LogLevel};

    #[tokio::test]
    async fn captures_one_build_invocation() {
        let temp = temp_root();
        let (services, session) = open(temp.path()).await;
        let output = CapturedOutput::new();
        let work = Compile::new("docs", "src", "index.html").failing("missing template");

        let outcome = run_with_logging_scope(LogLevel::Info, &output, || async {
            session.root_build_started().await;
            let outcome = services.execute(&work).await;
            session.root_build_completed(outcome).await
        })
        .await
        .unwrap();

        assert!(!outcome.is_success());
        assert!(output.contents().contains("missing template"));
    }
}

mod config {
    use tempfile::TempDir;
    use workcache::config::SettingsManager;

    #[tokio::test]
    async fn settings_round_trip_through_file() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::with_path(temp.path().join("config.toml"));

        let mut settings = manager.load().await.unwrap();
        settings.cleanup.max_age_days = 3;
        settings.cache.root = Some(temp.path().join("cache"));
        manager.save(&settings).await.unwrap();

        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.cleanup.max_age_days, 3);
        assert_eq!(loaded.cache.root, Some(temp.path().join("cache")));
    }
}
