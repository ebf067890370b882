//! Integration tests for dockrun
//!
//! Instance tests drive a fake container tool: a shell script that records
//! every invocation and emulates `exec` and `cp` on the local filesystem.
//! Touching `fail-build` or `fail-run` in its root makes those subcommands fail.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dockrun::config::Config;
use dockrun::instance::CleanupHooks;
use tempfile::TempDir;

const FAKE_TOOL: &str = r#"#!/bin/sh
root='@ROOT@'
echo "$*" >> "$root/calls.log"
sub="$1"; shift
case "$sub" in
  build)
    if [ -f "$root/fail-build" ]; then echo "build broke" >&2; exit 1; fi
    echo "Successfully built"
    ;;
  run)
    if [ -f "$root/fail-run" ]; then echo "port is already allocated" >&2; exit 125; fi
    mkdir -p "$root/ctr/workspace"
    echo "0123456789abcdef"
    ;;
  exec)
    while [ "${1#-}" != "$1" ]; do shift 2; done
    shift 4
    cd "$root/ctr/workspace" && exec sh -c "$1"
    ;;
  cp)
    case "$1" in
      dockrun-*:*)
        cp -R "$root/ctr${1#*:}" "$2"
        ;;
      *)
        dest="$root/ctr${2#*:}"
        mkdir -p "$(dirname "$dest")"
        cp -R "$1" "$dest"
        ;;
    esac
    ;;
  commit|stop)
    ;;
  kill)
    if [ -f "$root/killed" ]; then echo "No such container" >&2; exit 1; fi
    touch "$root/killed"
    ;;
  *)
    echo "unknown subcommand $sub" >&2
    exit 2
    ;;
esac
"#;

/// Temp dir with the fake tool installed and a config pointing at it
struct FakeTool {
    dir: TempDir,
    config: Config,
}

impl FakeTool {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-docker.sh");
        fs::write(
            &script,
            FAKE_TOOL.replace("@ROOT@", dir.path().to_str().unwrap()),
        )
        .unwrap();

        let mut config = Config::default();
        config.tool.program = "sh".to_string();
        config.tool.args = vec![script.to_string_lossy().into_owned()];
        config.container.shell = "sh".to_string();

        Self { dir, config }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn container_file(&self, path: &str) -> PathBuf {
        self.root().join("ctr").join(path.trim_start_matches('/'))
    }

    fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.root().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn count(&self, subcommand: &str) -> usize {
        let prefix = format!("{subcommand} ");
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }
}

fn hooks() -> Arc<CleanupHooks> {
    Arc::new(CleanupHooks::new())
}

mod instance_tests {
    use super::*;
    use dockrun::build::BuildConfig;
    use dockrun::error::DockrunError;
    use dockrun::instance::{CleanupRegistry, ExecOptions, Instance, InstanceOptions, InstanceState};
    use dockrun::process::Origin;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn quiet() -> InstanceOptions {
        InstanceOptions {
            silent: true,
            ..InstanceOptions::default()
        }
    }

    async fn running(tool: &FakeTool) -> Instance {
        let mut instance = Instance::new(&tool.config, quiet(), hooks());
        instance.init().await.unwrap();
        instance
    }

    fn dockerfile(tool: &FakeTool, contents: &str) -> PathBuf {
        let path = tool.root().join("Dockerfile");
        fs::write(&path, contents).unwrap();
        path
    }

    fn hash_records(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".hash.json"))
            .collect()
    }

    #[tokio::test]
    async fn init_starts_detached_container() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        assert_eq!(instance.state(), InstanceState::Running);
        assert!(instance.image().is_resolved());
        assert_eq!(instance.image().name(), "ubuntu:24.04");

        let run = tool.calls().into_iter().find(|c| c.starts_with("run ")).unwrap();
        assert!(run.contains("--rm -d --name"));
        assert!(run.contains(instance.id()));
    }

    #[tokio::test]
    async fn second_init_skips_cached_build() {
        let tool = FakeTool::new();
        let dockerfile = dockerfile(&tool, "FROM alpine\n");
        let build = BuildConfig::new(&dockerfile, tool.root()).build_arg("V", "1");

        let mut images = Vec::new();
        for _ in 0..2 {
            let mut instance = Instance::new(
                &tool.config,
                InstanceOptions {
                    build: Some(build.clone()),
                    ..quiet()
                },
                hooks(),
            );
            instance.init().await.unwrap();
            images.push(instance.image().name().to_string());
            instance.stop().await.unwrap();
        }

        assert_eq!(tool.count("build"), 1);
        assert_eq!(tool.count("run"), 2);
        assert_eq!(images[0], images[1]);
        assert!(images[0].starts_with("dockrun-build-"));
        assert_eq!(hash_records(tool.root()).len(), 1);
    }

    #[tokio::test]
    async fn changed_build_args_rebuild() {
        let tool = FakeTool::new();
        let dockerfile = dockerfile(&tool, "FROM alpine\n");

        for version in ["1", "2"] {
            let build = BuildConfig::new(&dockerfile, tool.root()).build_arg("V", version);
            let mut instance = Instance::new(
                &tool.config,
                InstanceOptions {
                    build: Some(build),
                    ..quiet()
                },
                hooks(),
            );
            instance.init().await.unwrap();
            instance.kill();
        }

        assert_eq!(tool.count("build"), 2);
        let builds: Vec<String> = tool
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("build "))
            .collect();
        assert!(builds[0].starts_with("build --build-arg V=1 -t dockrun-build-"));
        assert!(builds[1].starts_with("build --build-arg V=2 -t dockrun-build-"));
    }

    #[tokio::test]
    async fn stale_record_at_explicit_path_is_rebuilt() {
        let tool = FakeTool::new();
        let dockerfile = dockerfile(&tool, "FROM alpine\n");
        let record = tool.root().join("app.json");

        for contents in ["FROM alpine\n", "FROM debian\n"] {
            fs::write(&dockerfile, contents).unwrap();
            let build = BuildConfig::new(&dockerfile, tool.root())
                .image_name("app:dev")
                .hash_file(&record);
            let mut instance = Instance::new(
                &tool.config,
                InstanceOptions {
                    build: Some(build),
                    ..quiet()
                },
                hooks(),
            );
            instance.init().await.unwrap();
            assert_eq!(instance.image().name(), "app:dev");
            instance.kill();
        }

        assert_eq!(tool.count("build"), 2);
        let saved: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&record).unwrap()).unwrap();
        assert_eq!(saved["image"], "app:dev");
        assert!(saved["createdAt"].is_string());
    }

    #[tokio::test]
    async fn existence_only_cache_reuses_stale_record() {
        let mut tool = FakeTool::new();
        tool.config.cache.verify_digest = false;
        let dockerfile = dockerfile(&tool, "FROM alpine\n");
        let record = tool.root().join("app.json");

        for contents in ["FROM alpine\n", "FROM debian\n"] {
            fs::write(&dockerfile, contents).unwrap();
            let build = BuildConfig::new(&dockerfile, tool.root())
                .image_name("app:dev")
                .hash_file(&record);
            let mut instance = Instance::new(
                &tool.config,
                InstanceOptions {
                    build: Some(build),
                    ..quiet()
                },
                hooks(),
            );
            instance.init().await.unwrap();
            instance.kill();
        }

        assert_eq!(tool.count("build"), 1);
    }

    #[tokio::test]
    async fn failed_build_leaves_instance_unbuilt() {
        let tool = FakeTool::new();
        let dockerfile = dockerfile(&tool, "FROM alpine\n");
        fs::write(tool.root().join("fail-build"), "").unwrap();

        let mut instance = Instance::new(
            &tool.config,
            InstanceOptions {
                build: Some(BuildConfig::new(&dockerfile, tool.root())),
                ..quiet()
            },
            hooks(),
        );
        let err = instance.init().await.unwrap_err();

        assert!(matches!(err, DockrunError::BuildFailed { code: Some(1), .. }));
        assert_eq!(instance.state(), InstanceState::Unbuilt);
        assert!(!instance.image().is_resolved());
        assert!(hash_records(tool.root()).is_empty());
        assert_eq!(tool.count("run"), 0);
    }

    #[tokio::test]
    async fn exec_logs_stdout() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        let handle = instance.exec("echo ok", ExecOptions::default()).await.unwrap();
        assert!(handle
            .log()
            .iter()
            .any(|e| e.origin == Origin::Stdout && e.text == "ok"));
    }

    #[tokio::test]
    async fn exec_nonzero_exit_fails() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        let err = instance.exec("exit 12", ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, DockrunError::ExecFailed { code: Some(12), .. }));
        assert_eq!(err.exit_code(), Some(12));
    }

    #[tokio::test]
    async fn exec_custom_success_predicate() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        let options = ExecOptions {
            success: Some(Arc::new(|code: Option<i32>| code == Some(3))),
            ..ExecOptions::default()
        };
        assert!(instance.exec("exit 3", options.clone()).await.is_ok());
        assert!(instance.exec("exit 0", options).await.is_err());
    }

    #[tokio::test]
    async fn exec_captures_variables() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        let handle = instance
            .exec(
                "echo '###=> hi=world'; echo '###=> n=42'; echo done",
                ExecOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(handle.var("hi"), Some(json!("world")));
        assert_eq!(handle.var("n"), Some(json!(42)));
        assert_eq!(handle.stdout_lines(), vec!["done"]);
    }

    #[tokio::test]
    async fn exec_cancellation_resolves_quickly() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let mut handle = instance
            .exec(
                "sleep 50",
                ExecOptions {
                    cancel: Some(token),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.wait().await.unwrap(), None);
    }

    #[tokio::test]
    async fn instance_cancellation_kills_container() {
        let tool = FakeTool::new();
        let token = CancellationToken::new();
        let mut instance = Instance::new(
            &tool.config,
            InstanceOptions {
                cancel: Some(token.clone()),
                ..quiet()
            },
            hooks(),
        );
        instance.init().await.unwrap();

        token.cancel();
        let deadline = Instant::now() + Duration::from_secs(5);
        while tool.count("kill") == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tool.count("kill"), 1);
    }

    #[tokio::test]
    async fn cp_file_and_directory() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        let src = TempDir::new().unwrap();
        let file = src.path().join("hello.txt");
        fs::write(&file, "hello").unwrap();
        fs::create_dir_all(src.path().join("tree/nested")).unwrap();
        fs::write(src.path().join("tree/top.txt"), "top").unwrap();
        fs::write(src.path().join("tree/nested/deep.txt"), "deep").unwrap();

        instance.cp(&file, "in/hello.txt").await.unwrap();
        instance.cp(src.path().join("tree"), "copied").await.unwrap();

        assert_eq!(
            fs::read_to_string(tool.container_file("/workspace/in/hello.txt")).unwrap(),
            "hello"
        );
        assert_eq!(
            fs::read_to_string(tool.container_file("/workspace/copied/top.txt")).unwrap(),
            "top"
        );
        assert_eq!(
            fs::read_to_string(tool.container_file("/workspace/copied/nested/deep.txt")).unwrap(),
            "deep"
        );

        let handle = instance
            .exec("cat copied/nested/deep.txt", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.stdout_lines(), vec!["deep"]);
    }

    #[tokio::test]
    async fn copy_from_file_and_directory() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;
        instance
            .exec(
                "mkdir -p out/nested && echo top > out/top.txt && echo deep > out/nested/deep.txt && echo single > single.txt",
                ExecOptions::default(),
            )
            .await
            .unwrap();

        let dest = TempDir::new().unwrap();
        instance
            .copy_from("single.txt", dest.path().join("single.txt"))
            .await
            .unwrap();
        instance
            .copy_from("/workspace/out", dest.path().join("out"))
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(dest.path().join("single.txt")).unwrap(),
            "single\n"
        );
        assert_eq!(
            fs::read_to_string(dest.path().join("out/top.txt")).unwrap(),
            "top\n"
        );
        assert_eq!(
            fs::read_to_string(dest.path().join("out/nested/deep.txt")).unwrap(),
            "deep\n"
        );

        let expected = format!("cp {}:/workspace/single.txt ", instance.id());
        assert!(tool.calls().iter().any(|c| c.starts_with(&expected)));
    }

    #[tokio::test]
    async fn copy_from_missing_path_fails() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;
        let dest = TempDir::new().unwrap();

        let err = instance
            .copy_from("nope.txt", dest.path().join("nope.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, DockrunError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn failed_start_keeps_resolved_image() {
        let tool = FakeTool::new();
        fs::write(tool.root().join("fail-run"), "").unwrap();

        let mut instance = Instance::new(&tool.config, quiet(), hooks());
        let err = instance.init().await.unwrap_err();

        match err {
            DockrunError::ContainerStart(reason) => {
                assert!(reason.contains("port is already allocated"))
            }
            other => panic!("expected ContainerStart, got {other:?}"),
        }
        assert_eq!(instance.state(), InstanceState::Unbuilt);
        assert!(instance.image().is_resolved());
        assert_eq!(instance.image().name(), "ubuntu:24.04");
    }

    #[tokio::test]
    async fn failed_start_after_build_can_retry() {
        let tool = FakeTool::new();
        let dockerfile = dockerfile(&tool, "FROM alpine\n");
        fs::write(tool.root().join("fail-run"), "").unwrap();

        let mut instance = Instance::new(
            &tool.config,
            InstanceOptions {
                build: Some(BuildConfig::new(&dockerfile, tool.root())),
                ..quiet()
            },
            hooks(),
        );
        let err = instance.init().await.unwrap_err();

        assert!(matches!(err, DockrunError::ContainerStart(_)));
        assert_eq!(instance.state(), InstanceState::Built);
        assert!(instance.image().is_resolved());
        let image = instance.image().name().to_string();
        assert!(image.starts_with("dockrun-build-"));

        fs::remove_file(tool.root().join("fail-run")).unwrap();
        instance.init().await.unwrap();

        assert_eq!(instance.state(), InstanceState::Running);
        assert_eq!(instance.image().name(), image);
        assert_eq!(tool.count("build"), 1);
        assert_eq!(tool.count("run"), 2);
    }

    #[tokio::test]
    async fn signal_wiring_kills_once() {
        let tool = FakeTool::new();
        let registry = hooks();
        let token = CancellationToken::new();
        let on_signal = token.clone();
        registry.register(Box::new(move || on_signal.cancel()));

        let mut instance = Instance::new(
            &tool.config,
            InstanceOptions {
                cancel: Some(token.clone()),
                ..quiet()
            },
            registry.clone(),
        );
        instance.init().await.unwrap();

        assert_eq!(registry.run_all(), 2);
        assert!(token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(tool.count("kill"), 1);
        assert_eq!(instance.state(), InstanceState::Killed);

        instance.kill();
        instance.stop().await.unwrap();
        drop(instance);
        assert_eq!(tool.count("kill"), 1);
        assert_eq!(tool.count("stop"), 0);
    }

    #[tokio::test]
    async fn killed_by_hook_rejects_further_operations() {
        let tool = FakeTool::new();
        let registry = hooks();
        let mut instance = Instance::new(&tool.config, quiet(), registry.clone());
        instance.init().await.unwrap();

        registry.run_all();

        assert_eq!(instance.state(), InstanceState::Killed);
        let err = instance.exec("echo ok", ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, DockrunError::InvalidState { operation: "exec", .. }));
        let err = instance.cp(tool.root().join("calls.log"), "x").await.unwrap_err();
        assert!(matches!(err, DockrunError::InvalidState { operation: "cp", .. }));
        assert_eq!(tool.count("exec"), 0);
    }

    #[tokio::test]
    async fn commit_does_not_change_state() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;

        instance.commit("snapshot:1").await.unwrap();

        assert_eq!(instance.state(), InstanceState::Running);
        let expected = format!("commit {} snapshot:1", instance.id());
        assert!(tool.calls().contains(&expected));
    }

    #[tokio::test]
    async fn stop_then_kill_twice() {
        let tool = FakeTool::new();
        let mut instance = running(&tool).await;

        instance.stop().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
        instance.stop().await.unwrap();

        instance.kill();
        instance.kill();
        assert_eq!(instance.state(), InstanceState::Killed);
        assert_eq!(tool.count("stop"), 1);
        assert_eq!(tool.count("kill"), 1);
    }

    #[tokio::test]
    async fn cleanup_hooks_kill_container() {
        let tool = FakeTool::new();
        let registry = hooks();
        let mut instance = Instance::new(&tool.config, quiet(), registry.clone());
        instance.init().await.unwrap();

        assert_eq!(registry.run_all(), 1);
        assert_eq!(tool.count("kill"), 1);

        instance.stop().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropping_running_instance_kills_it() {
        let tool = FakeTool::new();
        let instance = running(&tool).await;
        let id = instance.id().to_string();

        drop(instance);

        assert!(tool.calls().contains(&format!("kill {id}")));
    }
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn dockrun() -> Command {
        cargo_bin_cmd!("dockrun")
    }

    fn write_config(tool: &FakeTool) -> PathBuf {
        let path = tool.root().join("config.toml");
        fs::write(&path, toml::to_string_pretty(&tool.config).unwrap()).unwrap();
        path
    }

    #[test]
    fn help_displays() {
        dockrun()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("container sandboxes"));
    }

    #[test]
    fn version_displays() {
        dockrun()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("dockrun"));
    }

    #[test]
    fn hash_prints_digest() {
        let dir = TempDir::new().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        fs::write(&dockerfile, "abc").unwrap();

        dockrun()
            .arg("hash")
            .arg("-f")
            .arg(&dockerfile)
            .assert()
            .success()
            .stdout("a9993e364706816aba3e25717850c26c9cd0d89d\n");
    }

    #[test]
    fn hash_missing_dockerfile_fails() {
        dockrun()
            .args(["hash", "-f", "/definitely/not/here/Dockerfile"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn config_path_respects_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");

        dockrun()
            .arg("--config")
            .arg(&path)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        dockrun()
            .arg("--config")
            .arg(dir.path().join("missing.toml"))
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[tool]"));
    }

    #[test]
    fn config_init_then_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        dockrun()
            .arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success();
        dockrun()
            .arg("--config")
            .arg(&path)
            .args(["config", "set", "tool.program", "podman"])
            .assert()
            .success();

        assert!(fs::read_to_string(&path).unwrap().contains("podman"));
    }

    #[test]
    fn run_prints_captured_variables() {
        let tool = FakeTool::new();
        let config = write_config(&tool);

        dockrun()
            .arg("--config")
            .arg(&config)
            .args(["run", "--", "echo", "'###=> answer=42'"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"answer\": 42"));

        assert_eq!(tool.count("stop"), 1);
    }

    #[test]
    fn run_failure_propagates_exit_code() {
        let tool = FakeTool::new();
        let config = write_config(&tool);

        dockrun()
            .arg("--config")
            .arg(&config)
            .args(["run", "-q", "--", "exit", "12"])
            .assert()
            .code(12)
            .stderr(predicate::str::contains("exit code: 12"));

        assert_eq!(tool.count("kill"), 1);
    }
}
