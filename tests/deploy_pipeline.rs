use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use noox_deploy::exit::{codes, exit_code};
use noox_deploy::image::{FFAT_SIZE, LITTLEFS_SIZE};
use noox_deploy::pipeline::RunLock;
use noox_deploy::platformio::current_filesystem;
use noox_deploy::{
    DeployConfig, Deployer, FilesystemKind, InterruptFlag, RunManifest, RunStatus, ScriptedRunner,
    StaticPorts,
};
use tempfile::TempDir;

const INI: &str = "\
[env:esp32s3_NOOX]
platform = espressif32
board = esp32-s3-devkitc-1
framework = arduino
; board_build.filesystem = littlefs
board_build.filesystem = spiffs
board_build.partitions = partitions_noox.csv
";

struct Project {
    _temp: TempDir,
    config: DeployConfig,
}

impl Project {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("noox");
        fs::create_dir_all(root.join("source_data")).unwrap();
        fs::write(root.join("platformio.ini"), INI).unwrap();
        fs::write(
            root.join("source_data/index.html"),
            "<html><body><div id=\"app\"></div></body></html>\n".repeat(80),
        )
        .unwrap();
        fs::write(
            root.join("source_data/style.css"),
            "body { font-family: sans-serif; }\n".repeat(60),
        )
        .unwrap();
        fs::write(
            root.join("source_data/script.js"),
            "fetch('/api/status').then(r => r.json());\n".repeat(70),
        )
        .unwrap();
        fs::create_dir_all(root.join("data_ffat")).unwrap();
        fs::write(root.join("data_ffat/agent.md"), "# agent\n").unwrap();

        let mut config = DeployConfig::new(&root);
        config.packages_root = Some(temp.path().join("packages"));
        config.python = "python".to_string();
        config.pio = "pio".to_string();
        config.upload_port = None;
        config.settle_delay = Duration::ZERO;

        Self {
            _temp: temp,
            config,
        }
    }

    fn root(&self) -> &Path {
        &self.config.project_dir
    }

    fn install_tool(&self, kind: FilesystemKind) {
        let dir = self
            .config
            .packages_root
            .as_ref()
            .unwrap()
            .join(format!("tool-{}", kind.tool_name()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(format!("{}{}", kind.tool_name(), std::env::consts::EXE_SUFFIX)),
            b"",
        )
        .unwrap();
    }

    fn deploy(&self, runner: &ScriptedRunner, interrupt: InterruptFlag) -> anyhow::Result<RunManifest> {
        let ports = StaticPorts::default();
        Deployer::new(&self.config, runner, &ports, interrupt).run()
    }

    fn manifest(&self) -> RunManifest {
        RunManifest::load(&RunManifest::path_in(&self.config.state_dir())).unwrap()
    }

    fn assert_cleaned_up(&self) {
        assert_eq!(fs::read_to_string(self.root().join("platformio.ini")).unwrap(), INI);
        assert!(!self.root().join("platformio.ini.backup").exists());
        assert!(!self.root().join("data").exists());
    }
}

/// `pio run --target buildfs` stand-in: writes the image for whichever
/// backend `platformio.ini` currently selects, and records the staged files.
fn fake_buildfs(
    config: &DeployConfig,
    staged: Rc<RefCell<Vec<Vec<String>>>>,
) -> impl Fn(&noox_deploy::Cmd) + 'static {
    let ini = config.ini_path();
    let staging = config.staging_path();
    let littlefs = config.image_output(FilesystemKind::LittleFs);
    let ffat = config.image_output(FilesystemKind::FFat);
    move |_| {
        let (image, size) = match current_filesystem(&ini).unwrap().as_deref() {
            Some("littlefs") => (&littlefs, LITTLEFS_SIZE),
            Some("fatfs") => (&ffat, FFAT_SIZE),
            other => panic!("unexpected backend {other:?}"),
        };
        fs::write(image, vec![0u8; size as usize]).unwrap();

        let mut names: Vec<String> = fs::read_dir(&staging)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        staged.borrow_mut().push(names);
    }
}

fn fake_tool_output(path: PathBuf, size: usize) -> impl Fn(&noox_deploy::Cmd) + 'static {
    move |_| fs::write(&path, vec![0u8; size]).unwrap()
}

#[test]
fn full_deployment_with_fallback_builds() {
    let project = Project::new();
    let staged = Rc::new(RefCell::new(Vec::new()));
    let runner = ScriptedRunner::new().on("buildfs", fake_buildfs(&project.config, staged.clone()));

    let manifest = project.deploy(&runner, InterruptFlag::manual()).unwrap();

    let calls = runner.invocations();
    assert_eq!(calls.len(), 6, "{calls:#?}");
    assert_eq!(calls[0], "pio run -e esp32s3_NOOX");
    assert_eq!(calls[1], "pio run -e esp32s3_NOOX --target upload");
    assert_eq!(calls[2], "pio run -e esp32s3_NOOX --target buildfs");
    assert!(calls[3].ends_with(&format!(
        "write_flash 0x810000 {}",
        project.config.image_output(FilesystemKind::LittleFs).display()
    )));
    assert!(calls[3].starts_with("python -m esptool --chip esp32s3 --port COM3 --baud 460800"));
    assert_eq!(calls[4], "pio run -e esp32s3_NOOX --target buildfs");
    assert!(calls[5].contains("write_flash 0xA10000"));

    assert_eq!(
        *staged.borrow(),
        vec![
            vec!["index.html.gz", "script.js.gz", "style.css.gz"],
            vec!["agent.md"],
        ]
    );

    project.assert_cleaned_up();
    assert_eq!(manifest.status, RunStatus::Success);
    assert_eq!(manifest.completed_stages.len(), 5);
    assert_eq!(manifest.images.len(), 2);
    assert_eq!(project.manifest(), manifest);
}

#[test]
fn compression_stage_writes_one_gzip_per_source() {
    let project = Project::new();
    let runner = ScriptedRunner::new().fail_on("pio run");

    assert!(project.deploy(&runner, InterruptFlag::manual()).is_err());

    let out = project.root().join("data_littlefs");
    let gz: Vec<_> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "gz"))
        .collect();
    assert_eq!(gz.len(), 3);
    for path in gz {
        let source = project
            .root()
            .join("source_data")
            .join(path.file_stem().unwrap());
        assert!(fs::metadata(&path).unwrap().len() <= fs::metadata(&source).unwrap().len());
    }
}

#[test]
fn direct_tools_skip_fallback_and_mismatch_still_flashes() {
    let project = Project::new();
    project.install_tool(FilesystemKind::LittleFs);
    project.install_tool(FilesystemKind::FFat);
    let runner = ScriptedRunner::new()
        .on(
            "mklittlefs",
            fake_tool_output(project.config.image_output(FilesystemKind::LittleFs), 4096),
        )
        .on(
            "mkfatfs",
            fake_tool_output(
                project.config.image_output(FilesystemKind::FFat),
                FFAT_SIZE as usize,
            ),
        );

    let manifest = project.deploy(&runner, InterruptFlag::manual()).unwrap();

    assert_eq!(runner.count_matching("buildfs"), 0);
    assert_eq!(runner.count_matching("-s 2097152 -p 256 -b 4096"), 1);
    assert_eq!(runner.count_matching("-s 6225920"), 1);
    assert_eq!(runner.count_matching("write_flash 0x810000"), 1);
    assert_eq!(runner.count_matching("write_flash 0xA10000"), 1);

    let littlefs = &manifest.images[0];
    assert_eq!(littlefs.kind, "littlefs");
    assert_eq!(littlefs.size_bytes, 4096);
    assert_eq!(littlefs.expected_size_bytes, LITTLEFS_SIZE);
    project.assert_cleaned_up();
}

#[test]
fn failure_at_upload_stage_still_cleans_up() {
    let project = Project::new();
    fs::create_dir_all(project.root().join("data")).unwrap();
    fs::write(project.root().join("data/leftover.bin"), b"stale").unwrap();
    let runner = ScriptedRunner::new().fail_on("--target upload");

    let err = project.deploy(&runner, InterruptFlag::manual()).unwrap_err();

    assert_ne!(exit_code(&err), codes::SUCCESS);
    assert!(format!("{err:#}").contains("Failed to upload firmware"));
    assert_eq!(runner.count_matching("buildfs"), 0);
    assert_eq!(runner.count_matching("esptool"), 0);
    project.assert_cleaned_up();

    let manifest = project.manifest();
    assert_eq!(manifest.status, RunStatus::Failed);
    assert_eq!(manifest.failed_stage.as_deref(), Some("upload_firmware"));
    assert_eq!(manifest.completed_stages, ["compress", "build_firmware"]);
}

#[test]
fn failure_while_flashing_restores_patched_config() {
    let project = Project::new();
    let staged = Rc::new(RefCell::new(Vec::new()));
    let runner = ScriptedRunner::new()
        .on("buildfs", fake_buildfs(&project.config, staged))
        .fail_on("write_flash 0x810000");

    let err = project.deploy(&runner, InterruptFlag::manual()).unwrap_err();

    assert!(format!("{err:#}").contains("Failed to upload LittleFS"));
    assert_eq!(runner.count_matching("0xA10000"), 0);
    project.assert_cleaned_up();
    assert_eq!(
        project.manifest().failed_stage.as_deref(),
        Some("deploy_littlefs")
    );
}

#[test]
fn custom_env_is_selected_on_every_pio_command() {
    let mut project = Project::new();
    project.config.pio_env = "custom".to_string();
    let staged = Rc::new(RefCell::new(Vec::new()));
    let runner = ScriptedRunner::new().on("buildfs", fake_buildfs(&project.config, staged));

    let manifest = project.deploy(&runner, InterruptFlag::manual()).unwrap();

    let pio_calls: Vec<String> = runner
        .invocations()
        .into_iter()
        .filter(|line| line.starts_with("pio "))
        .collect();
    assert_eq!(
        pio_calls,
        [
            "pio run -e custom",
            "pio run -e custom --target upload",
            "pio run -e custom --target buildfs",
            "pio run -e custom --target buildfs",
        ]
    );
    assert!(manifest.images[0]
        .path
        .starts_with(project.root().join(".pio/build/custom")));
}

#[test]
fn stale_images_from_earlier_runs_are_never_flashed() {
    let project = Project::new();
    for kind in [FilesystemKind::LittleFs, FilesystemKind::FFat] {
        let image = project.config.image_output(kind);
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"STALE IMAGE FROM LAST WEEK").unwrap();
    }
    let runner = ScriptedRunner::new();

    let err = project.deploy(&runner, InterruptFlag::manual()).unwrap_err();

    assert!(format!("{err:#}").contains("LittleFS image not found"));
    assert_eq!(runner.count_matching("write_flash"), 0);
    assert_eq!(
        project.manifest().failed_stage.as_deref(),
        Some("deploy_littlefs")
    );
    project.assert_cleaned_up();
}

#[test]
fn missing_sources_abort_compression() {
    let project = Project::new();
    fs::remove_dir_all(project.root().join("source_data")).unwrap();
    let runner = ScriptedRunner::new();

    let err = project.deploy(&runner, InterruptFlag::manual()).unwrap_err();

    assert!(format!("{err:#}").contains("empty or missing"));
    assert!(runner.invocations().is_empty());
    project.assert_cleaned_up();
}

#[test]
fn interruption_exits_with_distinct_code() {
    let project = Project::new();
    let runner = ScriptedRunner::new();
    let interrupt = InterruptFlag::manual();
    interrupt.trigger();

    let err = project.deploy(&runner, interrupt).unwrap_err();

    assert_eq!(exit_code(&err), codes::INTERRUPTED);
    assert!(runner.invocations().is_empty());
    assert_eq!(project.manifest().status, RunStatus::Interrupted);
    project.assert_cleaned_up();
}

#[test]
fn interruption_during_tool_run_is_not_reported_as_failure() {
    let project = Project::new();
    let interrupt = InterruptFlag::manual();
    let flag = interrupt.clone();
    let runner = ScriptedRunner::new()
        .on("--target upload", move |_| flag.trigger())
        .fail_on("--target upload");

    let err = project.deploy(&runner, interrupt).unwrap_err();

    assert_eq!(exit_code(&err), codes::INTERRUPTED);
    assert_eq!(runner.count_matching("--target upload"), 1);
    assert_eq!(runner.count_matching("buildfs"), 0);
    let manifest = project.manifest();
    assert_eq!(manifest.status, RunStatus::Interrupted);
    assert_eq!(manifest.failed_stage.as_deref(), Some("upload_firmware"));
    project.assert_cleaned_up();
}

#[test]
fn interruption_while_settling_keeps_stage_completed() {
    let project = Project::new();
    let staged = Rc::new(RefCell::new(Vec::new()));
    let interrupt = InterruptFlag::manual();
    let flag = interrupt.clone();
    let runner = ScriptedRunner::new()
        .on("buildfs", fake_buildfs(&project.config, staged))
        .on("write_flash 0x810000", move |_| flag.trigger());

    let err = project.deploy(&runner, interrupt).unwrap_err();

    assert_eq!(exit_code(&err), codes::INTERRUPTED);
    assert_eq!(runner.count_matching("write_flash 0xA10000"), 0);
    let manifest = project.manifest();
    assert_eq!(manifest.status, RunStatus::Interrupted);
    assert_eq!(manifest.failed_stage, None);
    assert_eq!(
        manifest.completed_stages.last().map(String::as_str),
        Some("deploy_littlefs")
    );
    project.assert_cleaned_up();
}

#[test]
fn concurrent_run_is_refused() {
    let project = Project::new();
    let _held = RunLock::acquire(&project.config.state_dir()).unwrap();
    let runner = ScriptedRunner::new();

    let err = project.deploy(&runner, InterruptFlag::manual()).unwrap_err();

    assert!(err.to_string().contains("already running"));
    assert!(runner.invocations().is_empty());
    assert!(!project.root().join("data_littlefs").exists());
}
