//! End-to-end conformance runs: each trial spawns this same binary as a
//! subject process and drives it over the wire and control channels.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use libtest_mimic::{Arguments, Trial};

use wireprobe_harness::proto::interface::{
    CURSOR, CURSOR_EV_BUTTON, CURSOR_EV_LEAVE, CURSOR_EV_MOTION, HUB, JOB, JOB_EV_DONE, KEYPAD,
    KEYPAD_EV_KEY, MONITOR, MONITOR_EV_DONE, MONITOR_EV_GEOMETRY, TOUCHPAD, TOUCHPAD_EV_FRAME,
    TOUCHPAD_EV_UP,
};
use wireprobe_harness::proto::{Arg, DeviceKind, Fixed, ProtocolObject};
use wireprobe_harness::{
    compare, subject_entry, CapSlot, Caps, ControlPipe, ControlRequest, MessageDescriptor,
    MessageLog, Session, SessionConfig, Subject, SubjectFn,
};

// ---------------------------------------------------------------------------
// Subject bodies, run in the child process.

fn subject_immediate_ok(_pipe: ControlPipe) -> i32 {
    0
}

fn subject_exit_42(_pipe: ControlPipe) -> i32 {
    42
}

fn subject_barrier(pipe: ControlPipe) -> i32 {
    let mut subject = Subject::populate(pipe);
    subject.barrier();
    0
}

fn subject_run_func(pipe: ControlPipe) -> i32 {
    let mut subject = Subject::populate(pipe);
    subject.call_user_func();
    subject.call_user_func();
    0
}

fn subject_send_bytes(pipe: ControlPipe) -> i32 {
    let mut subject = Subject::populate(pipe);
    subject.send_bytes(&[0xde, 0xad, 0xbe, 0xef]);
    0
}

/// Binds input devices, records everything the driver replays, and ships
/// the recording back.
fn subject_record_inputs(pipe: ControlPipe) -> i32 {
    let mut subject = Subject::populate(pipe);
    assert_eq!(subject.globals(), ["wp_hub"]);
    subject.bind(&HUB);
    subject.get_device(DeviceKind::Cursor);
    subject.get_device(DeviceKind::Keypad);
    subject.roundtrip();

    subject.attach_log(MessageLog::new());
    let record: wireprobe_harness::subject::Listener =
        Box::new(|s, msg| {
            s.log_mut().append(&msg.descriptor(), msg.args());
        });
    subject.set_listener(CapSlot::Cursor, record);
    subject.set_listener(
        CapSlot::Keypad,
        Box::new(|s, msg| {
            s.log_mut().append(&msg.descriptor(), msg.args());
        }),
    );

    let emitted = subject.ask_emit(0);
    assert_eq!(emitted, 3);
    assert!(subject.is_emitting());
    subject.roundtrip();
    assert!(!subject.is_emitting());

    assert_eq!(subject.log_mut().count(), 3);
    let last = subject.last_message(CapSlot::Keypad).expect("keypad message");
    assert_eq!(last.descriptor().message_name(), "key");

    subject.send_log();
    0
}

/// Steps through a two-entry log one message at a time.
fn subject_monitor_steps(pipe: ControlPipe) -> i32 {
    let mut subject = Subject::populate(pipe);
    assert_eq!(subject.globals(), ["wp_hub", "wp_monitor"]);
    subject.bind(&MONITOR);
    subject.set_slot_data(CapSlot::Monitor, Box::new("primary".to_string()));
    subject.roundtrip();

    subject.attach_log(MessageLog::new());
    subject.set_listener(
        CapSlot::Monitor,
        Box::new(|s, msg| {
            s.log_mut().append(&msg.descriptor(), msg.args());
        }),
    );

    assert_eq!(subject.ask_emit_one(), 1);
    assert_eq!(subject.ask_emit_one(), 0);
    subject.roundtrip();

    assert_eq!(subject.log_mut().count(), 2);
    let label = subject
        .slot_data(CapSlot::Monitor)
        .and_then(|d| d.downcast_ref::<String>())
        .expect("slot label");
    assert_eq!(label, "primary");
    subject.log_state();
    subject.send_log();
    0
}

/// Requests a touchpad the driver is configured to withhold, then asks for
/// an emission run that needs it. The driver dies mid-run, so this subject
/// never gets its acknowledgement; the driver reaps it.
fn subject_touchpad_blocked(pipe: ControlPipe) -> i32 {
    let mut subject = Subject::populate(pipe);
    subject.bind(&HUB);
    subject.get_device(DeviceKind::Cursor);
    subject.get_device(DeviceKind::Touchpad);
    subject.roundtrip();
    subject.ask_emit(0);
    0
}

/// Asks for emission over the bare control pipe, without ever connecting
/// to the wire socket.
fn subject_detached_emit(mut pipe: ControlPipe) -> i32 {
    pipe.send_request(&ControlRequest::EventCount(0));
    pipe.read_ack();
    0
}

/// Starts a job and receives a completion event that references the job
/// object itself.
fn subject_job_done(pipe: ControlPipe) -> i32 {
    let mut subject = Subject::populate(pipe);
    subject.bind(&HUB);
    let job = subject.start_job();
    subject.roundtrip();
    // Let the driver's test code pick up the job resource and build its log.
    subject.barrier();

    subject.attach_log(MessageLog::new());
    subject.set_listener(
        CapSlot::Job,
        Box::new(|s, msg| {
            s.log_mut().append(&msg.descriptor(), msg.args());
        }),
    );
    assert_eq!(subject.ask_emit(0), 1);
    subject.roundtrip();

    let last = subject.last_message(CapSlot::Job).expect("job message");
    assert_eq!(last.args()[0], Arg::Object(job.object_id()));
    subject.send_log();
    0
}

const SUBJECTS: &[(&str, SubjectFn)] = &[
    ("immediate_ok", subject_immediate_ok),
    ("exit_42", subject_exit_42),
    ("barrier", subject_barrier),
    ("run_func", subject_run_func),
    ("send_bytes", subject_send_bytes),
    ("record_inputs", subject_record_inputs),
    ("monitor_steps", subject_monitor_steps),
    ("touchpad_blocked", subject_touchpad_blocked),
    ("detached_emit", subject_detached_emit),
    ("job_done", subject_job_done),
];

// ---------------------------------------------------------------------------
// Driver-side trials.

fn clean_exit_passes_the_verdict() {
    let mut session = Session::create(SessionConfig::default());
    session.spawn_subject("immediate_ok");
    session.run();
    assert!(session.subject_exited());
    assert_eq!(session.subject_exit_code(), Some(0));
}

fn unexpected_exit_code_fails_at_teardown() {
    let mut session = Session::create(SessionConfig::default());
    session.spawn_subject("exit_42");
    session.run();
    assert_eq!(session.subject_exit_code(), Some(42));

    let verdict = catch_unwind(AssertUnwindSafe(move || drop(session)));
    assert!(verdict.is_err(), "teardown should have failed the test");
}

fn expected_exit_code_is_accepted() {
    let mut session = Session::create(SessionConfig::default());
    session.expect_exit_code(42);
    session.spawn_subject("exit_42");
    session.run();
}

fn barrier_rendezvous() {
    let mut session = Session::create(SessionConfig::default());
    session.spawn_subject("barrier");
    session.run();
    assert_eq!(
        session.pending_request(),
        Some(wireprobe_harness::ControlOp::Barrier)
    );
    session.barrier();
    assert_eq!(session.subject_exit_code(), Some(0));
}

fn user_func_runs_on_request() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);

    let mut session = Session::create(SessionConfig::default());
    session.set_user_func(move || {
        seen.fetch_add(1, Ordering::Relaxed);
    });
    session.set_user_data(Box::new("scripted state".to_string()));
    session.spawn_subject("run_func");
    session.run();
    session.run_user_func();
    session.run_user_func();
    assert_eq!(calls.load(Ordering::Relaxed), 2);

    let data = session.take_user_data().expect("stashed data");
    assert_eq!(
        data.downcast_ref::<String>().map(String::as_str),
        Some("scripted state")
    );
}

fn sent_bytes_land_in_the_driver() {
    let mut session = Session::create(SessionConfig::default());
    session.spawn_subject("send_bytes");
    session.run();
    session.receive_bytes();
    assert_eq!(
        session.take_received_bytes(),
        Some(vec![0xde, 0xad, 0xbe, 0xef])
    );
    assert_eq!(session.take_received_bytes(), None);
}

fn input_log() -> MessageLog {
    let mut log = MessageLog::new();
    log.append(
        &MessageDescriptor::define(&CURSOR, CURSOR_EV_BUTTON),
        &[Arg::Uint(5), Arg::Uint(100), Arg::Uint(272), Arg::Uint(1)],
    );
    log.append(
        &MessageDescriptor::define(&CURSOR, CURSOR_EV_MOTION),
        &[
            Arg::Uint(101),
            Arg::Fixed(Fixed::from_f64(1.5)),
            Arg::Fixed(Fixed::from_f64(-2.25)),
        ],
    );
    log.append(
        &MessageDescriptor::define(&KEYPAD, KEYPAD_EV_KEY),
        &[Arg::Uint(6), Arg::Uint(102), Arg::Uint(30), Arg::Uint(1)],
    );
    log
}

/// The full loop: script a log, replay it into the subject, get the
/// subject's recording back, and compare the two.
fn replayed_messages_match_the_script() {
    let mut session = Session::create(SessionConfig::default());
    session.attach_log(input_log());
    session.spawn_subject("record_inputs");
    session.run();

    session.emit_events();
    session.receive_bytes();

    let received = session.take_received_log().expect("shipped log");
    let report = compare(session.attached_log().expect("script"), &received);
    assert!(report.is_match(), "{report}");
    assert_eq!(session.attached_log().unwrap().remaining(), 0);
}

fn single_step_emission() {
    let mut log = MessageLog::new();
    log.append(
        &MessageDescriptor::define(&MONITOR, MONITOR_EV_GEOMETRY),
        &[Arg::Int(0), Arg::Int(0), Arg::Int(1920), Arg::Int(1080)],
    );
    log.append(&MessageDescriptor::define(&MONITOR, MONITOR_EV_DONE), &[]);

    let config = SessionConfig {
        globals: Caps::HUB | Caps::MONITOR,
        ..SessionConfig::default()
    };
    let mut session = Session::create(config);
    session.attach_log(log);
    session.spawn_subject("monitor_steps");
    session.run();

    session.emit_event();
    session.emit_event();
    session.receive_bytes();

    let received = session.take_received_log().expect("shipped log");
    let report = compare(session.attached_log().expect("script"), &received);
    assert!(report.is_match(), "{report}");
}

/// Emission into an object the configuration withheld is fatal for the
/// driver; the stuck subject is then aborted explicitly.
fn emission_without_the_resource_is_fatal() {
    let config = SessionConfig {
        globals: Caps::HUB,
        resources: Caps::all().difference(Caps::TOUCHPAD),
    };
    let mut session = Session::create(config);

    let mut log = MessageLog::new();
    log.append(
        &MessageDescriptor::define(&CURSOR, CURSOR_EV_BUTTON),
        &[Arg::Uint(5), Arg::Uint(100), Arg::Uint(272), Arg::Uint(1)],
    );
    log.append(
        &MessageDescriptor::define(&CURSOR, CURSOR_EV_LEAVE),
        &[Arg::Uint(7)],
    );
    log.append(
        &MessageDescriptor::define(&TOUCHPAD, TOUCHPAD_EV_UP),
        &[Arg::Uint(8)],
    );
    log.append(
        &MessageDescriptor::define(&TOUCHPAD, TOUCHPAD_EV_FRAME),
        &[],
    );
    session.attach_log(log);

    session.spawn_subject("touchpad_blocked");
    session.run();

    let outcome = catch_unwind(AssertUnwindSafe(|| session.emit_events()));
    assert!(outcome.is_err(), "emission should have died on wp_touchpad");

    session.abort_subject();
}

/// Emission requested before the subject attaches to the wire is fatal,
/// even with a populated log.
fn emission_before_attachment_is_fatal() {
    let mut session = Session::create(SessionConfig::default());

    let mut log = MessageLog::new();
    log.append(
        &MessageDescriptor::define(&CURSOR, CURSOR_EV_LEAVE),
        &[Arg::Uint(7)],
    );
    session.attach_log(log);

    session.spawn_subject("detached_emit");
    session.run();

    let outcome = catch_unwind(AssertUnwindSafe(|| session.emit_events()));
    assert!(outcome.is_err(), "emission should have died off the wire");

    session.abort_subject();
}

/// A dynamic-interface message is addressed through its own object
/// argument, and that reference survives the trip through the subject.
fn job_completion_round_trip() {
    let mut session = Session::create(SessionConfig::default());
    session.spawn_subject("job_done");
    session.run();

    // First stop is the subject's barrier, taken after it started the job.
    let job = session.resource_of(&JOB).expect("job resource");
    let mut log = MessageLog::new();
    log.append(
        &MessageDescriptor::define(&JOB, JOB_EV_DONE),
        &[Arg::object(&job), Arg::Uint(7)],
    );
    session.attach_log(log);
    session.barrier();

    session.emit_events();
    session.receive_bytes();

    let received = session.take_received_log().expect("shipped log");
    let report = compare(session.attached_log().expect("script"), &received);
    assert!(report.is_match(), "{report}");
}

fn trial(name: &'static str, f: fn()) -> Trial {
    Trial::test(name, move || {
        f();
        Ok(())
    })
}

fn main() {
    subject_entry(SUBJECTS);
    wireprobe_harness::init_diagnostics();

    let args = Arguments::from_args();
    let trials = vec![
        trial("clean_exit_passes_the_verdict", clean_exit_passes_the_verdict),
        trial(
            "unexpected_exit_code_fails_at_teardown",
            unexpected_exit_code_fails_at_teardown,
        ),
        trial("expected_exit_code_is_accepted", expected_exit_code_is_accepted),
        trial("barrier_rendezvous", barrier_rendezvous),
        trial("user_func_runs_on_request", user_func_runs_on_request),
        trial("sent_bytes_land_in_the_driver", sent_bytes_land_in_the_driver),
        trial(
            "replayed_messages_match_the_script",
            replayed_messages_match_the_script,
        ),
        trial("single_step_emission", single_step_emission),
        trial(
            "emission_without_the_resource_is_fatal",
            emission_without_the_resource_is_fatal,
        ),
        trial(
            "emission_before_attachment_is_fatal",
            emission_before_attachment_is_fatal,
        ),
        trial("job_completion_round_trip", job_completion_round_trip),
    ];
    libtest_mimic::run(&args, trials).exit();
}
