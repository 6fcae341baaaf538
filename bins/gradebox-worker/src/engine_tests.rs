/// Integration tests against a live Docker daemon
///
/// These verify what the in-memory runtime cannot:
/// 1. Runaway submissions are killed at the deadline
/// 2. No container outlives its run, on success or on timeout
/// 3. The sandbox posture holds inside the container
/// 4. Session exec and file writes work on the read-only rootfs

#[cfg(test)]
mod docker_tests {
    use crate::config::TrackConfigManager;
    use crate::engine::{ContainerRunDescriptor, ContainerRuntime, DockerEngine, NetworkPolicy};
    use gradebox_common::types::Track;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    const IMAGE: &str = "alpine:3.19";

    fn engine() -> DockerEngine {
        DockerEngine::connect(true).expect("Failed to connect to Docker")
    }

    fn descriptor(command: &[&str], timeout: Duration) -> ContainerRunDescriptor {
        let manager = TrackConfigManager::built_in();
        let config = manager.get_config(Track::Data).expect("data track configured");
        ContainerRunDescriptor::new(Uuid::new_v4(), Track::Data, IMAGE, config)
            .with_command(command.iter().map(|s| s.to_string()).collect())
            .with_timeout(timeout)
    }

    /// Test: an infinite loop is killed near the deadline and leaves nothing behind
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_infinite_loop_times_out() {
        let engine = engine();
        let descriptor = descriptor(&["sh", "-c", "while true; do :; done"], Duration::from_secs(3));

        let start = Instant::now();
        let result = engine.run(&descriptor).await.expect("run should complete");
        let elapsed = start.elapsed();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);

        let leftovers = engine.leftover_containers(&descriptor.run_id).await.unwrap();
        assert!(leftovers.is_empty(), "leftover containers: {:?}", leftovers);
    }

    /// Test: exit codes and output come back and the container is removed
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_exit_code_and_cleanup() {
        let engine = engine();
        let descriptor = descriptor(&["sh", "-c", "echo hello; echo oops >&2; exit 3"], Duration::from_secs(30));

        let result = engine.run(&descriptor).await.expect("run should complete");
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.log.contains("oops"));
        assert!(engine.leftover_containers(&descriptor.run_id).await.unwrap().is_empty());
    }

    /// Test: nobody user, read-only rootfs, no network
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_sandbox_posture() {
        let engine = engine();
        let script = "id -u; touch /etc/x 2>/dev/null && echo rootfs-writable; \
                      touch /workspace/ok && echo scratch-ok; \
                      wget -q -T 2 -O /dev/null http://example.com 2>/dev/null && echo online";
        let descriptor = descriptor(&["sh", "-c", script], Duration::from_secs(30));

        let result = engine.run(&descriptor).await.expect("run should complete");
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines, vec!["65534", "scratch-ok"]);
    }

    /// Test: a session survives several execs, writes files and tears down its network
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_session_exec_and_write() {
        let engine = engine();
        let descriptor = descriptor(&["sleep", "60"], Duration::from_secs(60))
            .with_network(NetworkPolicy::Isolated { emulator: None });

        let mut session = engine.open_session(&descriptor).await.expect("session should start");
        let contents = "resource \"aws_s3_bucket\" \"b\" {\n  bucket = \"x\"\n}\n".repeat(200);
        session
            .write_file("/workspace/main.tf", &contents, Duration::from_secs(30))
            .await
            .expect("write should succeed");

        let cat = vec!["cat".to_string(), "/workspace/main.tf".to_string()];
        let result = session.exec(&cat, &[], Duration::from_secs(10)).await.unwrap();
        assert_eq!(result.stdout, contents);
        assert!(session.is_running().await.unwrap());

        let warnings = session.close().await;
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert!(engine.leftover_containers(&descriptor.run_id).await.unwrap().is_empty());
    }
}
