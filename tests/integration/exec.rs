#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, thread, time::Duration};

use common::shared_reaper;
use warden::exec::{
    ChannelStream, ExecArgs, ExecManager, ExecStream, Execution, StreamFrame, StreamKey,
    control::{ControlMessage, ResizeArgs, SignalArgs},
    stream_pair,
};

fn attach(manager: &ExecManager, execution: &Execution, key: StreamKey) -> ChannelStream {
    let (client, server) = stream_pair();
    manager
        .connect(
            execution.stream_id(key).expect("stream id"),
            Arc::new(server),
        )
        .expect("connect stream");
    client
}

fn send_control(control: &ChannelStream, message: &ControlMessage) {
    control
        .send(StreamFrame::Text(
            serde_json::to_string(message).expect("serialize control message"),
        ))
        .expect("send control message");
}

fn collect_text(stream: &ChannelStream) -> String {
    let mut bytes = Vec::new();
    loop {
        match stream.recv() {
            Ok(StreamFrame::Binary(chunk)) => bytes.extend(chunk),
            Ok(StreamFrame::Close) | Err(_) => break,
            Ok(StreamFrame::Text(_)) => {}
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[test]
fn pty_exec_honors_initial_size_and_resize() {
    let manager = ExecManager::new(shared_reaper());
    let execution = manager
        .exec(ExecArgs {
            // Print the terminal size twice with a pause in between so the
            // resize lands before the second read.
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "stty size; sleep 0.6; stty size".to_string(),
            ],
            use_terminal: true,
            width: 80,
            height: 24,
            ..ExecArgs::default()
        })
        .expect("exec");

    let stdio = attach(&manager, &execution, StreamKey::Stdio);
    let control = attach(&manager, &execution, StreamKey::Control);

    let run_manager = Arc::clone(&manager);
    let run_execution = Arc::clone(&execution);
    let runner = thread::spawn(move || run_manager.run(&run_execution));

    thread::sleep(Duration::from_millis(200));
    send_control(
        &control,
        &ControlMessage {
            command: "resize".to_string(),
            signal: None,
            resize: Some(ResizeArgs {
                width: 132,
                height: 50,
            }),
        },
    );

    let output = collect_text(&stdio);
    assert_eq!(runner.join().expect("join").expect("run"), 0);

    // stty prints "rows cols".
    assert!(
        output.contains("24 80"),
        "initial window size missing from output: {output:?}"
    );
    assert!(
        output.contains("50 132"),
        "resized window size missing from output: {output:?}"
    );
}

#[test]
fn pty_exec_forwards_signals_by_name() {
    let manager = ExecManager::new(shared_reaper());
    let execution = manager
        .exec(ExecArgs {
            command: vec!["sleep".to_string(), "30".to_string()],
            use_terminal: true,
            width: 80,
            height: 24,
            ..ExecArgs::default()
        })
        .expect("exec");

    let _stdio = attach(&manager, &execution, StreamKey::Stdio);
    let control = attach(&manager, &execution, StreamKey::Control);

    let run_manager = Arc::clone(&manager);
    let run_execution = Arc::clone(&execution);
    let runner = thread::spawn(move || run_manager.run(&run_execution));

    thread::sleep(Duration::from_millis(300));
    send_control(
        &control,
        &ControlMessage {
            command: "signal".to_string(),
            signal: Some(SignalArgs {
                name: "TERM".to_string(),
            }),
            resize: None,
        },
    );

    let code = runner.join().expect("join").expect("run");
    assert_eq!(code, 128 + libc::SIGTERM);
    assert_eq!(execution.exit_code(), Some(128 + libc::SIGTERM));
}

#[test]
fn lost_control_stream_kills_the_child() {
    let manager = ExecManager::new(shared_reaper());
    let execution = manager
        .exec(ExecArgs {
            command: vec!["sleep".to_string(), "30".to_string()],
            ..ExecArgs::default()
        })
        .expect("exec");

    let _stdio = attach(&manager, &execution, StreamKey::Stdio);
    let control = attach(&manager, &execution, StreamKey::Control);

    let run_manager = Arc::clone(&manager);
    let run_execution = Arc::clone(&execution);
    let runner = thread::spawn(move || run_manager.run(&run_execution));

    // Dropping the endpoint without a close frame is an abnormal closure.
    thread::sleep(Duration::from_millis(300));
    drop(control);

    let code = runner.join().expect("join").expect("run");
    assert_eq!(code, 128 + libc::SIGKILL);
}

#[test]
fn unknown_control_commands_are_ignored() {
    let manager = ExecManager::new(shared_reaper());
    let execution = manager
        .exec(ExecArgs {
            command: vec!["cat".to_string()],
            ..ExecArgs::default()
        })
        .expect("exec");

    let stdio = attach(&manager, &execution, StreamKey::Stdio);
    let control = attach(&manager, &execution, StreamKey::Control);

    let run_manager = Arc::clone(&manager);
    let run_execution = Arc::clone(&execution);
    let runner = thread::spawn(move || run_manager.run(&run_execution));

    control
        .send(StreamFrame::Text(
            r#"{"command":"levitate","altitude":{"meters":3}}"#.to_string(),
        ))
        .expect("send unknown command");

    stdio
        .send(StreamFrame::Binary(b"still alive\n".to_vec()))
        .expect("send input");
    stdio.close();

    let output = collect_text(&stdio);
    assert_eq!(output, "still alive\n");
    assert_eq!(runner.join().expect("join").expect("run"), 0);
    control.close();
}
