use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use snipbox::sandbox::{CODE_ENV, LogChunk, SandboxRuntime};
use snipbox::{Config, Engine, ExecutionRequest, OutputFrame};

use super::fake_runtime::{FakeRuntime, Script, Stage};
use super::{drain, frame_channel, stdout_text, test_config};

fn engine_with(config: Config, runtime: &Arc<FakeRuntime>) -> Engine {
    let runtime: Arc<dyn SandboxRuntime> = runtime.clone();
    Engine::new(config, runtime)
}

async fn run(engine: &Engine, request: ExecutionRequest) -> Vec<OutputFrame> {
    let (sink, rx) = frame_channel();
    engine.execute_streaming(&request, &sink).await;
    drop(sink);
    drain(rx).await
}

fn exit_code(frames: &[OutputFrame]) -> Option<i32> {
    match frames.last() {
        Some(OutputFrame::Exit { exit_code, .. }) => Some(*exit_code),
        _ => None,
    }
}

#[tokio::test]
async fn test_python_hello() {
    let runtime = FakeRuntime::new(Script::stdout("2\n"));
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("print(1+1)", "python")).await;

    assert_eq!(frames.len(), 2);
    assert_eq!(stdout_text(&frames), "2\n");
    assert_eq!(exit_code(&frames), Some(0));
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_javascript_exit_code() {
    let runtime = FakeRuntime::new(Script::exit(3));
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("process.exit(3)", "javascript")).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(exit_code(&frames), Some(3));
    assert_eq!(runtime.removed().len(), 1);
}

#[tokio::test]
async fn test_unsupported_language() {
    let runtime = FakeRuntime::new(Script::default());
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("puts 1", "ruby")).await;

    assert_eq!(frames, vec![OutputFrame::error("Unsupported language: ruby")]);
    assert_eq!(runtime.created(), 0);
}

#[tokio::test]
async fn test_unsupported_language_is_reported_normalized() {
    let runtime = FakeRuntime::new(Script::default());
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("puts 1", " Ruby ")).await;

    assert_eq!(frames, vec![OutputFrame::error("Unsupported language: ruby")]);
    assert_eq!(runtime.created(), 0);
}

#[tokio::test]
async fn test_language_lookup_ignores_case() {
    let runtime = FakeRuntime::new(Script::stdout("ok\n"));
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("print('ok')", "PyThOn")).await;

    assert_eq!(exit_code(&frames), Some(0));
    assert_eq!(runtime.created(), 1);
}

#[tokio::test]
async fn test_frames_keep_arrival_order() {
    let script = Script::exit(1).with_chunks(vec![
        LogChunk::stdout("a"),
        LogChunk::stderr("oops"),
        LogChunk::stdout("b"),
    ]);
    let runtime = FakeRuntime::new(script);
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("x", "python")).await;

    assert_eq!(&frames[..3], &[
        OutputFrame::stdout("a"),
        OutputFrame::stderr("oops"),
        OutputFrame::stdout("b"),
    ]);
    assert_eq!(exit_code(&frames), Some(1));
}

#[tokio::test]
async fn test_output_truncated_at_ceiling() {
    let chunk = "x".repeat(600);
    let script = Script::default().with_chunks(vec![
        LogChunk::stdout(chunk.clone()),
        LogChunk::stdout(chunk.clone()),
        LogChunk::stdout(chunk),
    ]);
    let runtime = FakeRuntime::new(script);
    let mut config = test_config();
    config.limits = config.limits.with_max_output_bytes(1024);
    let engine = engine_with(config, &runtime);

    let frames = run(&engine, ExecutionRequest::new("spam()", "python")).await;

    assert_eq!(stdout_text(&frames).len(), 1024);
    let notices: Vec<_> = frames
        .iter()
        .filter(|frame| matches!(frame, OutputFrame::Stderr { .. }))
        .collect();
    assert_eq!(
        notices,
        vec![&OutputFrame::stderr("\n... output truncated (1KB limit)")]
    );
    // Notice comes right before the exit frame
    assert!(matches!(frames[frames.len() - 2], OutputFrame::Stderr { .. }));
    assert_eq!(exit_code(&frames), Some(0));
}

#[tokio::test]
async fn test_output_at_ceiling_is_not_truncated() {
    let runtime = FakeRuntime::new(Script::stdout(&"y".repeat(1024)));
    let mut config = test_config();
    config.limits = config.limits.with_max_output_bytes(1024);
    let engine = engine_with(config, &runtime);

    let frames = run(&engine, ExecutionRequest::new("y", "python")).await;

    assert_eq!(frames.len(), 2);
    assert_eq!(stdout_text(&frames).len(), 1024);
}

#[tokio::test]
async fn test_timeout_reports_and_cleans_up() {
    let runtime = FakeRuntime::new(Script::hang().with_chunks(vec![LogChunk::stdout("tick\n")]));
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("while True: pass", "python")).await;

    assert_eq!(frames[0], OutputFrame::stdout("tick\n"));
    assert_eq!(frames[1], OutputFrame::error("Execution timed out after 0.2s"));
    match frames[2] {
        OutputFrame::Exit {
            exit_code,
            elapsed_ms,
        } => {
            assert_eq!(exit_code, 1);
            assert!(elapsed_ms >= 200, "elapsed {elapsed_ms}ms");
            assert!(elapsed_ms < 2_000, "elapsed {elapsed_ms}ms");
        }
        ref other => panic!("expected exit frame, got {other:?}"),
    }
    assert_eq!(frames.len(), 3);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_slow_start_counts_against_timeout() {
    let script = Script::stdout("never\n").starting_for(Duration::from_secs(5));
    let runtime = FakeRuntime::new(script);
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("print(1)", "python")).await;

    assert_eq!(
        frames[0],
        OutputFrame::error("Execution timed out after 0.2s")
    );
    match frames[1] {
        OutputFrame::Exit {
            exit_code,
            elapsed_ms,
        } => {
            assert_eq!(exit_code, 1);
            assert!(elapsed_ms < 2_000, "elapsed {elapsed_ms}ms");
        }
        ref other => panic!("expected exit frame, got {other:?}"),
    }
    assert_eq!(frames.len(), 2);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_create_failure() {
    let runtime = FakeRuntime::new(Script::default().failing_at(Stage::Create));
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("print(1)", "python")).await;

    assert_eq!(frames[0], OutputFrame::error("Execution failed"));
    assert_eq!(exit_code(&frames), Some(1));
    assert_eq!(frames.len(), 2);
    assert_eq!(runtime.created(), 0);
}

#[tokio::test]
async fn test_lifecycle_failures_remove_sandbox() {
    for stage in [Stage::Start, Stage::Logs, Stage::Wait] {
        let script = Script::stdout("partial\n").failing_at(stage);
        let runtime = FakeRuntime::new(script);
        let engine = engine_with(test_config(), &runtime);

        let frames = run(&engine, ExecutionRequest::new("print(1)", "python")).await;

        let n = frames.len();
        assert_eq!(frames[n - 2], OutputFrame::error("Execution failed"), "{stage:?}");
        assert_eq!(exit_code(&frames), Some(1), "{stage:?}");
        assert_eq!(runtime.created(), 1, "{stage:?}");
        assert_eq!(runtime.live(), 0, "{stage:?}");
    }
}

#[tokio::test]
async fn test_partial_output_survives_stream_failure() {
    let runtime = FakeRuntime::new(Script::stdout("partial\n").failing_at(Stage::Logs));
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("print(1)", "python")).await;

    assert_eq!(frames[0], OutputFrame::stdout("partial\n"));
    assert_eq!(frames.len(), 3);
}

#[tokio::test]
async fn test_cleanup_failure_is_not_reported() {
    let runtime = FakeRuntime::new(Script::stdout("done\n").failing_at(Stage::Remove));
    let engine = engine_with(test_config(), &runtime);

    let frames = run(&engine, ExecutionRequest::new("print('done')", "python")).await;

    assert_eq!(
        frames.iter().filter(|f| matches!(f, OutputFrame::Error { .. })).count(),
        0
    );
    assert_eq!(exit_code(&frames), Some(0));
}

#[tokio::test]
async fn test_character_split_across_chunks() {
    let script = Script::default().with_chunks(vec![
        LogChunk::stdout(b"h\xc3".to_vec()),
        LogChunk::stdout(b"\xa9llo".to_vec()),
    ]);
    let runtime = FakeRuntime::new(script);
    let engine = engine_with(test_config(), &runtime);

    let response = engine
        .execute(&ExecutionRequest::new("print('h\u{e9}llo')", "python"))
        .await;

    assert_eq!(response.stdout, "h\u{e9}llo");
    assert_eq!(response.exit_code, 0);
}

#[tokio::test]
async fn test_split_characters_on_both_streams() {
    let euro = "\u{20ac}".as_bytes();
    let script = Script::default().with_chunks(vec![
        LogChunk::stdout(&euro[..2]),
        LogChunk::stderr(b"\xc3".to_vec()),
        LogChunk::stdout(&euro[2..]),
        LogChunk::stderr(b"\xa9".to_vec()),
        // Dangling start byte when the stream ends
        LogChunk::stdout(b"!\xe2".to_vec()),
    ]);
    let runtime = FakeRuntime::new(script);
    let engine = engine_with(test_config(), &runtime);

    let response = engine.execute(&ExecutionRequest::new("x", "python")).await;

    assert_eq!(response.stdout, "\u{20ac}!\u{FFFD}");
    assert_eq!(response.stderr, "\u{e9}");
}

#[tokio::test]
async fn test_execute_aggregates_frames() {
    let script = Script::exit(2).with_chunks(vec![
        LogChunk::stdout("out1 "),
        LogChunk::stderr("err"),
        LogChunk::stdout("out2"),
    ]);
    let runtime = FakeRuntime::new(script);
    let engine = engine_with(test_config(), &runtime);

    let response = engine
        .execute(&ExecutionRequest::new("x", "javascript"))
        .await;

    assert_eq!(response.stdout, "out1 out2");
    assert_eq!(response.stderr, "err");
    assert_eq!(response.exit_code, 2);
    assert!(!response.is_success());
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_execute_unsupported_language() {
    let runtime = FakeRuntime::new(Script::default());
    let engine = engine_with(test_config(), &runtime);

    let response = engine.execute(&ExecutionRequest::new("x", "cobol")).await;

    assert_eq!(response.exit_code, 1);
    assert_eq!(response.stderr, "Unsupported language: cobol");
}

#[tokio::test]
async fn test_sandbox_receives_hardened_spec() {
    let runtime = FakeRuntime::new(Script::default());
    let mut config = test_config();
    config.limits = config.limits.with_memory_limit_mb(256);
    let engine = engine_with(config, &runtime);

    let request = ExecutionRequest::new("import os", "python").with_stdin("42\n");
    run(&engine, request).await;

    let spec = runtime.last_spec().expect("a sandbox was created");
    assert_eq!(spec.image(), "python:3.12-slim");
    assert_eq!(spec.network_mode(), "none");
    assert!(spec.read_only_root());
    assert_eq!(spec.dropped_capabilities(), ["ALL"]);
    assert_eq!(spec.user(), "nobody");
    assert_eq!(spec.memory_bytes(), 256 * 1024 * 1024);
    assert!(spec.env().iter().any(|var| var == "PYTHONUNBUFFERED=1"));

    let code = spec
        .env()
        .iter()
        .find_map(|var| var.strip_prefix(&format!("{CODE_ENV}=")))
        .map(|encoded| STANDARD.decode(encoded).unwrap())
        .unwrap();
    assert_eq!(code, b"import os");
}

#[tokio::test]
async fn test_concurrent_executions_do_not_leak() {
    let runtime = FakeRuntime::new(Script::stdout("hi\n"));
    let engine = engine_with(test_config(), &runtime);

    let runs = (0..16).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let language = if i % 2 == 0 { "python" } else { "javascript" };
            engine.execute(&ExecutionRequest::new("x", language)).await
        })
    });
    for handle in futures::future::join_all(runs).await {
        assert_eq!(handle.unwrap().stdout, "hi\n");
    }

    assert_eq!(runtime.created(), 16);
    assert_eq!(runtime.live(), 0);
}
