//! End-to-end voice turns against mock STT / chat / TTS servers.

mod common;

use common::{collect_turn, init_tracing, settings_for, states, CapturingOutput, ScriptedMic};
use httpmock::prelude::*;
use parley_voice::{
    encode_wav, AudioBuffer, ChatRole, ReadinessGate, SpeechClient, TurnEvent, TurnRejected,
    TurnState, VoiceSettings, VoiceTurnStateMachine,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn reply_wav() -> Vec<u8> {
    encode_wav(&AudioBuffer::new(vec![0.1; 1600], 16000, 1))
}

fn build(
    settings: VoiceSettings,
    mic: ScriptedMic,
    output: Arc<CapturingOutput>,
) -> (
    VoiceTurnStateMachine,
    tokio::sync::mpsc::UnboundedReceiver<TurnEvent>,
) {
    let client = SpeechClient::from_settings(&settings);
    VoiceTurnStateMachine::new(
        settings,
        client,
        Arc::new(mic),
        output,
        ReadinessGate::always_ready(),
    )
}

#[tokio::test]
async fn full_turn_plays_reply_and_records_history() {
    init_tracing();
    let server = MockServer::start_async().await;
    let stt = server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200)
                .json_body(json!({"text": "what time is it", "language": "en"}));
        })
        .await;
    let chat = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .body_includes("what time is it")
                .body_includes("\"role\":\"system\"");
            then.status(200).json_body(json!({
                "choices": [{"message": {"role": "assistant", "content": "Time for tea."}}]
            }));
        })
        .await;
    let tts = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/synthesize")
                .json_body_includes(json!({"text": "Time for tea."}).to_string());
            then.status(200).body(reply_wav());
        })
        .await;

    let output = Arc::new(CapturingOutput::default());
    let settings = VoiceSettings {
        response_volume: 0.8,
        ..settings_for(&server)
    };
    let (machine, mut events) = build(settings, ScriptedMic::speech_then_silence(5, 30), Arc::clone(&output));

    let id = machine.start_turn().unwrap();
    let seen = collect_turn(&mut events).await;

    assert_eq!(
        states(&seen),
        vec![
            TurnState::Recording,
            TurnState::Trimming,
            TurnState::Transcribing,
            TurnState::AwaitingReply,
            TurnState::Synthesizing,
            TurnState::Playing,
            TurnState::Idle,
        ]
    );
    assert!(seen.contains(&TurnEvent::Transcript {
        turn: id,
        text: "what time is it".to_string()
    }));
    assert!(seen.contains(&TurnEvent::Reply {
        turn: id,
        text: "Time for tea.".to_string()
    }));
    assert!(seen.contains(&TurnEvent::Completed { turn: id }));

    stt.assert_async().await;
    chat.assert_async().await;
    tts.assert_async().await;

    assert_eq!(output.played_count(), 1);
    let (played, volume) = output.played.lock().unwrap()[0].clone();
    assert_eq!(played.len(), 1600);
    assert_eq!(volume, 0.8);

    let history = machine.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, ChatRole::User);
    assert_eq!(history[1].content, "Time for tea.");
    assert_eq!(machine.state(), TurnState::Idle);
}

#[tokio::test]
async fn stt_server_error_fails_before_awaiting_reply() {
    init_tracing();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(500).body("internal error");
        })
        .await;
    let chat = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({"choices": []}));
        })
        .await;

    let output = Arc::new(CapturingOutput::default());
    let (machine, mut events) = build(
        settings_for(&server),
        ScriptedMic::speech_then_silence(3, 30),
        Arc::clone(&output),
    );

    let id = machine.start_turn().unwrap();
    let seen = collect_turn(&mut events).await;

    assert_eq!(
        states(&seen),
        vec![
            TurnState::Recording,
            TurnState::Trimming,
            TurnState::Transcribing,
            TurnState::Failed,
            TurnState::Idle,
        ]
    );
    let failure = seen.iter().find_map(|e| match e {
        TurnEvent::Failed { turn, message } if *turn == id => Some(message.clone()),
        _ => None,
    });
    assert!(failure.unwrap().contains("500"));
    assert_eq!(chat.hits_async().await, 0);
    assert_eq!(output.played_count(), 0);
    assert!(machine.history().is_empty());
}

#[tokio::test]
async fn silence_short_circuits_without_calling_stt() {
    init_tracing();
    let server = MockServer::start_async().await;
    let stt = server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200).json_body(json!({"text": "ghost"}));
        })
        .await;

    let (machine, mut events) = build(
        settings_for(&server),
        ScriptedMic::silence(30),
        Arc::new(CapturingOutput::default()),
    );

    let id = machine.start_turn().unwrap();
    let seen = collect_turn(&mut events).await;

    assert_eq!(
        states(&seen),
        vec![TurnState::Recording, TurnState::Trimming, TurnState::Idle]
    );
    assert!(seen.contains(&TurnEvent::NoSpeechDetected { turn: id }));
    assert_eq!(stt.hits_async().await, 0);
}

#[tokio::test]
async fn empty_transcript_ends_turn_as_no_speech() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200).json_body(json!({"text": " "}));
        })
        .await;
    let chat = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({"choices": []}));
        })
        .await;

    let (machine, mut events) = build(
        settings_for(&server),
        ScriptedMic::speech_then_silence(3, 30),
        Arc::new(CapturingOutput::default()),
    );
    let id = machine.start_turn().unwrap();
    let seen = collect_turn(&mut events).await;

    assert!(seen.contains(&TurnEvent::NoSpeechDetected { turn: id }));
    assert!(!states(&seen).contains(&TurnState::AwaitingReply));
    assert_eq!(chat.hits_async().await, 0);
}

#[tokio::test]
async fn cancel_aborts_slow_transcription() {
    init_tracing();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200)
                .json_body(json!({"text": "too late"}))
                .delay(Duration::from_secs(20));
        })
        .await;

    let output = Arc::new(CapturingOutput::default());
    let settings = VoiceSettings {
        stt_timeout_secs: 30.0,
        ..settings_for(&server)
    };
    let (machine, mut events) = build(settings, ScriptedMic::speech_then_silence(3, 30), Arc::clone(&output));
    let mut state = machine.subscribe_state();

    let id = machine.start_turn().unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == TurnState::Transcribing),
    )
    .await
    .unwrap()
    .unwrap();

    let started = std::time::Instant::now();
    assert!(machine.cancel());
    let seen = collect_turn(&mut events).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(seen.contains(&TurnEvent::Cancelled { turn: id }));
    let tail: Vec<_> = states(&seen).into_iter().rev().take(2).collect();
    assert_eq!(tail, vec![TurnState::Idle, TurnState::Cancelled]);
    assert!(output.stop_count() >= 1);
    assert!(machine.history().is_empty());
}

#[tokio::test]
async fn transient_stt_failures_are_retried_up_to_budget() {
    let server = MockServer::start_async().await;
    let stt = server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200)
                .json_body(json!({"text": "slow"}))
                .delay(Duration::from_secs(2));
        })
        .await;

    let settings = VoiceSettings {
        stt_timeout_secs: 0.2,
        stt_retry_attempts: 1,
        ..settings_for(&server)
    };
    let (machine, mut events) = build(
        settings,
        ScriptedMic::speech_then_silence(3, 30),
        Arc::new(CapturingOutput::default()),
    );
    machine.start_turn().unwrap();
    let seen = collect_turn(&mut events).await;

    assert!(states(&seen).contains(&TurnState::Failed));
    assert_eq!(stt.hits_async().await, 2);
}

#[tokio::test]
async fn second_turn_is_rejected_while_first_runs() {
    let server = MockServer::start_async().await;
    let (machine, mut events) = build(
        settings_for(&server),
        ScriptedMic::silence(30),
        Arc::new(CapturingOutput::default()),
    );

    machine.start_turn().unwrap();
    assert_eq!(machine.start_turn(), Err(TurnRejected::TurnActive));
    collect_turn(&mut events).await;

    // a finished turn frees the slot
    assert!(machine.start_turn().is_ok());
    machine.cancel();
}

#[tokio::test]
async fn toggle_press_stops_recording_early() {
    let server = MockServer::start_async().await;
    let stt = server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200).json_body(json!({"text": " "}));
        })
        .await;

    let settings = VoiceSettings {
        silence_timeout_secs: 30.0,
        max_recording_secs: 30.0,
        ..settings_for(&server)
    };
    // speech for far longer than the test waits
    let (machine, mut events) = build(
        settings,
        ScriptedMic::speech_then_silence(300, 0),
        Arc::new(CapturingOutput::default()),
    );

    let id = machine.activation_pressed().unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(machine.activation_pressed(), Ok(None));

    let seen = collect_turn(&mut events).await;
    assert!(states(&seen).contains(&TurnState::Transcribing));
    assert!(seen.contains(&TurnEvent::NoSpeechDetected { turn: id }));
    stt.assert_async().await;
}

/// STT and chat mocks that carry a turn through to synthesis.
async fn mock_transcript_and_reply(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200).json_body(json!({"text": "tell me a joke"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [{"message": {"role": "assistant", "content": "Knock knock."}}]
            }));
        })
        .await;
}

#[tokio::test]
async fn non_wav_speech_fails_turn_without_playing() {
    init_tracing();
    let server = MockServer::start_async().await;
    mock_transcript_and_reply(&server).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/synthesize");
            then.status(200)
                .header("content-type", "audio/mpeg")
                .body("ID3 this is not a wav file");
        })
        .await;

    let output = Arc::new(CapturingOutput::default());
    let (machine, mut events) = build(
        settings_for(&server),
        ScriptedMic::speech_then_silence(3, 30),
        Arc::clone(&output),
    );
    let id = machine.start_turn().unwrap();
    let seen = collect_turn(&mut events).await;

    assert_eq!(
        states(&seen),
        vec![
            TurnState::Recording,
            TurnState::Trimming,
            TurnState::Transcribing,
            TurnState::AwaitingReply,
            TurnState::Synthesizing,
            TurnState::Failed,
            TurnState::Idle,
        ]
    );
    assert!(seen
        .iter()
        .any(|e| matches!(e, TurnEvent::Failed { turn, .. } if *turn == id)));
    assert_eq!(output.played_count(), 0);
    assert!(machine.history().is_empty());
}

#[tokio::test]
async fn chat_reply_without_choices_fails_turn() {
    init_tracing();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/transcribe");
            then.status(200).json_body(json!({"text": "hello there"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({"id": "cmpl-1", "object": "chat.completion"}));
        })
        .await;
    let tts = server
        .mock_async(|when, then| {
            when.method(POST).path("/synthesize");
            then.status(200).body(reply_wav());
        })
        .await;

    let output = Arc::new(CapturingOutput::default());
    let (machine, mut events) = build(
        settings_for(&server),
        ScriptedMic::speech_then_silence(3, 30),
        Arc::clone(&output),
    );
    machine.start_turn().unwrap();
    let seen = collect_turn(&mut events).await;

    let tail: Vec<_> = states(&seen).into_iter().rev().take(3).collect();
    assert_eq!(
        tail,
        vec![TurnState::Idle, TurnState::Failed, TurnState::AwaitingReply]
    );
    let message = seen
        .iter()
        .find_map(|e| match e {
            TurnEvent::Failed { message, .. } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("choices"));
    assert_eq!(tts.hits_async().await, 0);
    assert_eq!(output.played_count(), 0);
    assert!(machine.history().is_empty());
}

#[tokio::test]
async fn cancel_during_playback_stops_output() {
    init_tracing();
    let server = MockServer::start_async().await;
    mock_transcript_and_reply(&server).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/synthesize");
            then.status(200).body(reply_wav());
        })
        .await;

    // far longer than the clip plus grace, so only cancellation ends it
    let output = Arc::new(CapturingOutput::holding(Duration::from_secs(60)));
    let (machine, mut events) = build(
        settings_for(&server),
        ScriptedMic::speech_then_silence(3, 30),
        Arc::clone(&output),
    );
    let mut state = machine.subscribe_state();

    let id = machine.start_turn().unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == TurnState::Playing),
    )
    .await
    .unwrap()
    .unwrap();
    while output.played_count() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(machine.cancel());
    let seen = collect_turn(&mut events).await;

    assert!(seen.contains(&TurnEvent::Cancelled { turn: id }));
    let tail: Vec<_> = states(&seen).into_iter().rev().take(3).collect();
    assert_eq!(
        tail,
        vec![TurnState::Idle, TurnState::Cancelled, TurnState::Playing]
    );
    assert_eq!(output.played_count(), 1);
    assert!(output.stop_count() >= 1);
    assert!(machine.history().is_empty());
    assert_eq!(machine.state(), TurnState::Idle);
}
