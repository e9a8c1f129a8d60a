use std::sync::Mutex;

use super::*;
use crate::core::task::SeparationParams;

fn request(output_dir: PathBuf) -> SeparationRequest {
    SeparationRequest {
        task_id: "sep-1".into(),
        input_path: PathBuf::from("/uploads/song.wav"),
        output_dir,
        params: SeparationParams::new("htdemucs", "configs/htdemucs.yaml", vec!["vocals".into()]),
        device: Device::cuda(1),
    }
}

fn shell(script: &str) -> CommandSeparator {
    CommandSeparator::new("sh", vec!["-c".into(), script.into()])
}

#[cfg(unix)]
#[test]
fn reads_progress_and_outputs_from_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("sep-1");
    let separator = shell(
        r#"cat > /dev/null
echo '{"progress": 12.5, "stage": "Loading model"}'
echo 'torch: some unrelated log line'
echo '{"progress": 43.75, "stage": "Processing chunks (25/100)"}'
echo "{\"outputs\": {\"vocals\": \"$STEMFORGE_DEVICE.wav\"}}""#,
    );

    let seen = Mutex::new(Vec::new());
    let listener = |p: f64, s: &str| seen.lock().unwrap().push((p, s.to_string()));
    let outputs = separator.separate(&request(out.clone()), &listener).unwrap();

    assert_eq!(outputs.get("vocals"), Some(&PathBuf::from("cuda:1.wav")));
    assert_eq!(
        *seen.lock().unwrap(),
        [
            (12.5, "Loading model".to_string()),
            (43.75, "Processing chunks (25/100)".to_string()),
        ]
    );
    assert!(out.is_dir());
}

#[cfg(unix)]
#[test]
fn request_is_written_to_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let separator = shell(
        r#"if grep -q '"task_id":"sep-1"'; then
  echo '{"outputs": {"vocals": "ok.wav"}}'
fi"#,
    );
    let outputs = separator
        .separate(&request(dir.path().to_path_buf()), &crate::core::progress::NoOpListener)
        .unwrap();
    assert_eq!(outputs.len(), 1);
}

#[cfg(unix)]
#[test]
fn non_zero_exit_carries_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let separator = shell("echo 'RuntimeError: CUDA out of memory' >&2; exit 3");
    let err = separator
        .separate(&request(dir.path().to_path_buf()), &crate::core::progress::NoOpListener)
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("CUDA out of memory"), "{message}");
}

#[cfg(unix)]
#[test]
fn missing_outputs_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let separator = shell(r#"echo '{"progress": 50.0, "stage": "half way"}'"#);
    let err = separator
        .separate(&request(dir.path().to_path_buf()), &crate::core::progress::NoOpListener)
        .unwrap_err();
    assert!(err.to_string().contains("without reporting output files"));
}

#[test]
fn missing_program_fails_to_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let separator = CommandSeparator::new("/nonexistent/stemforge-separator", vec![]);
    let err = separator
        .separate(&request(dir.path().to_path_buf()), &crate::core::progress::NoOpListener)
        .unwrap_err();
    assert!(format!("{err:#}").contains("spawning separator"));
}

#[cfg(unix)]
#[test]
fn invalid_utf8_on_stdout_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let separator = shell(
        r#"cat > /dev/null
printf 'loading \377\n'
echo '{"outputs": {"vocals": "vocals.wav"}}'"#,
    );
    let outputs = separator
        .separate(&request(dir.path().to_path_buf()), &crate::core::progress::NoOpListener)
        .unwrap();
    assert_eq!(outputs.get("vocals"), Some(&PathBuf::from("vocals.wav")));
}

#[cfg(unix)]
#[test]
fn child_is_killed_when_the_run_unwinds() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let separator = shell(&format!(
        r#"echo $$ > '{}'
echo '{{"progress": 5.0, "stage": "Loading model"}}'
exec sleep 30"#,
        pid_file.display()
    ));

    let listener = |_: f64, _: &str| panic!("listener blew up");
    let started = std::time::Instant::now();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        separator.separate(&request(dir.path().join("out")), &listener)
    }));
    assert!(result.is_err());
    assert!(started.elapsed() < std::time::Duration::from_secs(20));

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let alive = std::process::Command::new("sh")
        .args(["-c", &format!("kill -0 {} 2>/dev/null", pid.trim())])
        .status()
        .unwrap();
    assert!(!alive.success(), "separator process {} still running", pid.trim());
}
