use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use ripeness_sorter::config::SorterConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SORTER_CONFIG",
        "SORTER_BROKER_ADDR",
        "SORTER_TOPIC",
        "SORTER_CONFIDENCE_THRESHOLD",
        "SORTER_COOLDOWN_SECS",
        "SORTER_FLUSH_FRAMES",
        "SORTER_CAMERA_DEVICE",
        "SORTER_MODEL_PATH",
        "SORTER_SERIAL_PORT",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SorterConfig::load().expect("load config");

    assert_eq!(cfg.channel.broker_addr, "127.0.0.1:1883");
    assert_eq!(cfg.channel.topic, "robotica/frutas");
    assert_eq!(cfg.vision.confidence_threshold, 0.75);
    assert_eq!(cfg.vision.cooldown, Duration::from_secs(6));
    assert_eq!(cfg.vision.flush_frames, 5);
    assert_eq!(cfg.camera.device, "/dev/video0");
    assert_eq!(cfg.camera.fourcc, "MJPG");
    assert_eq!(cfg.detector.backend, "tract");
    assert_eq!(
        cfg.detector.class_names,
        vec!["half_ripe", "mold", "ripe", "rotten", "unripe"]
    );
    assert_eq!(cfg.relay.baud_rate, 9600);
    assert_eq!(cfg.relay.poll_interval, Duration::from_millis(10));
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".toml",
        r#"
            [channel]
            broker_addr = "mqtt://10.0.0.5"
            topic = "line2/fruit"

            [vision]
            confidence_threshold = 0.8
            cooldown_secs = 4.5
            flush_frames = 3

            [camera]
            device = "/dev/video2"
            fourcc = "yuyv"

            [detector]
            backend = "stub"
            class_names = ["ripe", "unripe"]

            [relay]
            serial_port = "/dev/ttyUSB0"
            poll_interval_ms = 20
        "#,
    );

    std::env::set_var("SORTER_CONFIG", file.path());
    std::env::set_var("SORTER_TOPIC", "line3/fruit");
    std::env::set_var("SORTER_FLUSH_FRAMES", "7");
    std::env::set_var("SORTER_SERIAL_PORT", "/dev/ttyACM1");

    let cfg = SorterConfig::load().expect("load config");

    assert_eq!(cfg.channel.broker_addr, "mqtt://10.0.0.5");
    assert_eq!(cfg.channel.topic, "line3/fruit");
    assert_eq!(cfg.vision.confidence_threshold, 0.8);
    assert_eq!(cfg.vision.cooldown, Duration::from_millis(4500));
    assert_eq!(cfg.vision.flush_frames, 7);
    assert_eq!(cfg.camera.device, "/dev/video2");
    assert_eq!(cfg.camera.fourcc, "YUYV");
    assert_eq!(cfg.camera.width, 800);
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.detector.class_names, vec!["ripe", "unripe"]);
    assert_eq!(cfg.relay.serial_port, "/dev/ttyACM1");
    assert_eq!(cfg.relay.poll_interval, Duration::from_millis(20));

    clear_env();
}

#[test]
fn loads_json_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".json",
        r#"{
            "vision": { "cooldown_secs": 2 },
            "detector": { "model_path": "models/fruit.onnx" }
        }"#,
    );
    std::env::set_var("SORTER_MODEL_PATH", "models/fruit-v2.onnx");

    let cfg = SorterConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.vision.cooldown, Duration::from_secs(2));
    assert_eq!(
        cfg.detector.model_path,
        PathBuf::from("models/fruit-v2.onnx")
    );

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SORTER_CONFIDENCE_THRESHOLD", "1.5");
    assert!(SorterConfig::load().is_err());
    clear_env();

    std::env::set_var("SORTER_COOLDOWN_SECS", "0");
    assert!(SorterConfig::load().is_err());
    clear_env();

    std::env::set_var("SORTER_COOLDOWN_SECS", "soon");
    assert!(SorterConfig::load().is_err());
    clear_env();

    std::env::set_var("SORTER_COOLDOWN_SECS", "1e30");
    let err = SorterConfig::load().unwrap_err();
    assert!(err.to_string().contains("out of range"), "{err:#}");
    clear_env();

    let huge = write_temp(".toml", "[vision]\ncooldown_secs = 1e300\n");
    assert!(SorterConfig::load_from(Some(huge.path())).is_err());

    std::env::set_var("SORTER_TOPIC", "robotica/#");
    assert!(SorterConfig::load().is_err());
    clear_env();

    std::env::set_var("SORTER_FLUSH_FRAMES", "500");
    assert!(SorterConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_unknown_keys_and_bad_syntax() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let typo = write_temp(".toml", "[vision]\ncooldown = 6\n");
    let err = SorterConfig::load_from(Some(typo.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    let broken = write_temp(".json", "{ \"vision\": ");
    assert!(SorterConfig::load_from(Some(broken.path())).is_err());

    let missing = SorterConfig::load_from(Some(std::path::Path::new(
        "/nonexistent/sorter.toml",
    )));
    assert!(missing.is_err());
}
