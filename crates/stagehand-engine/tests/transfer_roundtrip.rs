//! End-to-end sessions: a real uploader and downloader joined by an
//! in-process channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stagehand_cache::{file_digest, ReuseCache};
use stagehand_config::Config;
use stagehand_engine::{build_input_plan, build_output_plan, Downloader, TransferPlan, Uploader};
use stagehand_plugins::{PluginEnvironment, PluginInvoker, PluginPrivilege, PluginRegistry};
use stagehand_queue::ImmediateCoordinator;
use stagehand_types::job::{
    ATTR_EXECUTABLE_CHECKSUM, ATTR_JOB_CMD, ATTR_MAX_DOWNLOAD_BYTES, ATTR_OUTPUT_DESTINATION,
    ATTR_TRANSFER_INPUT_FILES, ATTR_TRANSFER_OUTPUT_FILES,
};
use stagehand_types::{
    ChecksumKind, HoldCode, JobRecord, PeerCapabilities, TransferSummary, EXEC_RENAME_BASENAME,
};
use stagehand_wire::{Framer, GoAheadInfo, MemoryChannel, TransferAck, TransferCommand};

fn invoker() -> PluginInvoker {
    PluginInvoker::new(
        PluginEnvironment::default(),
        PluginPrivilege::Service,
        Duration::from_secs(30),
    )
}

fn make_uploader(job: &JobRecord, registry: PluginRegistry) -> Uploader {
    Uploader::new(
        job.clone(),
        Arc::new(Config::default()),
        PeerCapabilities::default(),
        registry,
        invoker(),
        Arc::new(ImmediateCoordinator),
    )
}

fn make_downloader(
    job: &JobRecord,
    sandbox: &Path,
    final_transfer: bool,
    registry: PluginRegistry,
) -> Downloader {
    Downloader::new(
        job.clone(),
        Arc::new(Config::default()),
        PeerCapabilities::default(),
        registry,
        invoker(),
        Arc::new(ImmediateCoordinator),
        sandbox.to_path_buf(),
        final_transfer,
    )
}

async fn run_session(
    uploader: Uploader,
    plan: TransferPlan,
    downloader: Downloader,
) -> (TransferSummary, TransferSummary) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (up_chan, down_chan) = MemoryChannel::pair();
    let up_task = tokio::spawn(async move {
        let mut uploader = uploader;
        let mut framer = Framer::new(up_chan);
        uploader.run(&mut framer, plan).await
    });
    let down_task = tokio::spawn(async move {
        let mut downloader = downloader;
        let mut framer = Framer::new(down_chan);
        downloader.run(&mut framer).await
    });
    (up_task.await.unwrap(), down_task.await.unwrap())
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    drop(file);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[cfg(unix)]
fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

/// Seed 1: a small fanout of plain files and a directory arrives intact,
/// bytes and modes included.
#[tokio::test]
async fn small_input_fanout() {
    use std::os::unix::fs::PermissionsExt;

    let iwd = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    std::fs::write(iwd.path().join("a.txt"), vec![b'a'; 1024]).unwrap();
    std::fs::set_permissions(
        iwd.path().join("a.txt"),
        std::fs::Permissions::from_mode(0o640),
    )
    .unwrap();
    std::fs::write(iwd.path().join("b.bin"), vec![0u8; 10 * 1024]).unwrap();
    std::fs::create_dir(iwd.path().join("d")).unwrap();
    std::fs::write(iwd.path().join("d/c"), vec![b'c'; 100]).unwrap();

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string())
        .with_str(ATTR_TRANSFER_INPUT_FILES, "a.txt, b.bin, d");
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader = make_downloader(&job, sandbox.path(), true, PluginRegistry::default());
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(up.success, "upload failed: {:?}", up.failure);
    assert!(down.success, "download failed: {:?}", down.failure);
    assert_eq!(up.bytes, 11_364);
    assert_eq!(up.files, 3);

    assert_eq!(
        std::fs::read(sandbox.path().join("a.txt")).unwrap(),
        vec![b'a'; 1024]
    );
    assert_eq!(
        std::fs::read(sandbox.path().join("b.bin")).unwrap(),
        vec![0u8; 10 * 1024]
    );
    assert_eq!(
        std::fs::read(sandbox.path().join("d/c")).unwrap(),
        vec![b'c'; 100]
    );
    assert_eq!(mode_of(&sandbox.path().join("a.txt")), 0o640);
}

/// Seed 2: a URL input is fetched by the receiver's plugin and reports
/// statistics under its protocol.
#[tokio::test]
async fn url_download_via_plugin() {
    let iwd = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();

    let plugin = script(
        tools.path(),
        "http_plugin",
        "head -c 1048576 /dev/zero > \"$2\"\n\
         echo 'TransferProtocol = \"http\"'\n\
         echo 'TransferTotalBytes = 1048576'",
    );
    let mut registry = PluginRegistry::default();
    registry.register("http", &plugin, false);

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string())
        .with_str(ATTR_TRANSFER_INPUT_FILES, "http://example/x.dat");
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader = make_downloader(&job, sandbox.path(), true, registry);
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(up.success);
    assert!(down.success, "download failed: {:?}", down.failure);
    assert_eq!(
        std::fs::metadata(sandbox.path().join("x.dat")).unwrap().len(),
        1_048_576
    );
    let stats = down
        .file_stats
        .iter()
        .find(|s| s.protocol == "http")
        .expect("plugin statistics missing");
    assert!(stats.success);
    assert_eq!(stats.bytes, 1_048_576);
}

/// Seed 3: a malicious sender cannot write outside the sandbox; the
/// session ends held with the illegal-path reason.
#[tokio::test]
async fn illegal_path_is_diverted_and_held() {
    let outer = tempfile::tempdir().unwrap();
    let sandbox = outer.path().join("sandbox");
    let payload_dir = tempfile::tempdir().unwrap();
    let payload_path = payload_dir.path().join("payload");
    std::fs::write(&payload_path, b"escape attempt").unwrap();

    let job = JobRecord::new(17, 0, "alice", &outer.path().display().to_string());
    let downloader = make_downloader(&job, &sandbox, true, PluginRegistry::default());

    let (up_chan, down_chan) = MemoryChannel::pair();
    let sender = tokio::spawn(async move {
        let mut framer = Framer::new(up_chan);
        framer.send_xfer_info(14).await.unwrap();
        framer.recv_go_ahead().await.unwrap();
        framer.send_go_ahead(&GoAheadInfo::always()).await.unwrap();

        framer.send_command(TransferCommand::File).await.unwrap();
        framer.send_filename("../escape").await.unwrap();
        let mut file = tokio::fs::File::open(&payload_path).await.unwrap();
        framer.send_file(&mut file, 14, None).await.unwrap();

        framer.send_command(TransferCommand::Finished).await.unwrap();
        framer.send_ack(&TransferAck::success()).await.unwrap();
        framer.recv_ack().await.unwrap()
    });

    let down_task = tokio::spawn(async move {
        let mut downloader = downloader;
        let mut framer = Framer::new(down_chan);
        downloader.run(&mut framer).await
    });

    let peer_view = sender.await.unwrap();
    let down = down_task.await.unwrap();

    assert!(!down.success);
    assert!(!down.try_again());
    let failure = down.failure.unwrap();
    assert_eq!(failure.hold_code, Some(HoldCode::DownloadFileError.code()));
    assert!(failure.reason.contains("illegal sandbox path"));
    assert!(!outer.path().join("escape").exists());
    assert!(!peer_view.success);
}

/// Seed 4: an offer beyond the receiver's byte limit fails with the
/// dedicated quota hold and leaves the committed sandbox untouched.
#[tokio::test]
async fn quota_exceeded_holds_and_preserves_sandbox() {
    let iwd = tempfile::tempdir().unwrap();
    let spool_root = tempfile::tempdir().unwrap();
    let spool = spool_root.path().join("17").join("0");
    std::fs::write(iwd.path().join("big.bin"), vec![9u8; 16 * 1024]).unwrap();

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string())
        .with_str(ATTR_TRANSFER_INPUT_FILES, "big.bin")
        .with_int(ATTR_MAX_DOWNLOAD_BYTES, 4 * 1024);
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader = make_downloader(&job, &spool, false, PluginRegistry::default());
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(!down.success);
    assert!(!down.try_again());
    assert_eq!(
        down.failure.unwrap().hold_code,
        Some(HoldCode::MaxTransferOutputSizeExceeded.code())
    );
    // Nothing was committed.
    let committed: Vec<_> = std::fs::read_dir(&spool).unwrap().collect();
    assert!(committed.is_empty());
    // The uploader adopts the peer's verdict.
    assert!(!up.success);
    assert_eq!(
        up.failure.unwrap().hold_code,
        Some(HoldCode::MaxTransferOutputSizeExceeded.code())
    );
}

/// Seed 5: a cache hit keeps the executable off the wire entirely and
/// still produces a runnable staged copy.
#[tokio::test]
async fn reuse_hit_skips_executable_transfer() {
    let iwd = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();

    let exec_bytes = b"#!/bin/sh\nexit 0\n".to_vec();
    std::fs::write(iwd.path().join("prog"), &exec_bytes).unwrap();
    let digest = file_digest(ChecksumKind::Sha256, &iwd.path().join("prog"))
        .await
        .unwrap();

    // Pre-populate the receiver's cache under the job owner's tag.
    let cache = ReuseCache::open(cache_dir.path().join("cache"), 1 << 20)
        .await
        .unwrap();
    let reservation = cache
        .reserve_space(exec_bytes.len() as u64, Duration::from_secs(60), "Owner_alice")
        .unwrap();
    cache
        .cache_file(
            &iwd.path().join("prog"),
            &digest,
            ChecksumKind::Sha256,
            &reservation,
        )
        .await
        .unwrap();
    drop(reservation);

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string())
        .with_str(ATTR_JOB_CMD, "prog")
        .with_str(ATTR_EXECUTABLE_CHECKSUM, format!("sha256:{digest}"));
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader =
        make_downloader(&job, sandbox.path(), true, PluginRegistry::default()).with_cache(cache);
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(up.success, "upload failed: {:?}", up.failure);
    assert!(down.success, "download failed: {:?}", down.failure);
    // Nothing travelled over the framed channel.
    assert_eq!(up.bytes, 0);

    let staged = sandbox.path().join(EXEC_RENAME_BASENAME);
    assert_eq!(std::fs::read(&staged).unwrap(), exec_bytes);
    assert_eq!(mode_of(&staged) & 0o111, 0o111);
    assert!(
        stagehand_engine::uploader::verify_executable(&staged, ChecksumKind::Sha256, &digest)
            .await
            .unwrap()
    );
}

/// Seed 6: an object-store destination is signed by the receiver and the
/// sender uploads to the signed URL, reporting the outcome in-band.
#[tokio::test]
async fn sign_request_and_url_upload() {
    let sandbox_src = tempfile::tempdir().unwrap();
    let sandbox_dst = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();

    std::fs::write(sandbox_src.path().join("obj"), b"object bytes").unwrap();
    std::fs::write(sandbox_src.path().join("log.txt"), b"log line\n").unwrap();

    // The https plugin records the URL it was handed.
    let witness = tools.path().join("uploaded_to");
    let plugin = script(
        tools.path(),
        "https_plugin",
        &format!(
            "echo \"$2\" > {}\n\
             echo 'TransferProtocol = \"https\"'\n\
             echo 'TransferTotalBytes = 12'",
            witness.display()
        ),
    );
    let mut registry_up = PluginRegistry::default();
    registry_up.register("https", &plugin, false);

    let job = JobRecord::new(17, 0, "alice", &sandbox_src.path().display().to_string())
        .with_str(ATTR_TRANSFER_OUTPUT_FILES, "obj, log.txt")
        .with_str(ATTR_OUTPUT_DESTINATION, "s3://bucket/out/")
        .with_str(
            stagehand_types::job::ATTR_TRANSFER_OUTPUT_REMAPS,
            "log.txt=log.txt",
        );
    let plan = build_output_plan(&job, sandbox_src.path(), None, true).unwrap();
    // One object-store destination, one framed file.
    assert_eq!(plan.items.iter().filter(|i| i.has_dest_url()).count(), 1);
    assert_eq!(plan.items.iter().filter(|i| i.is_framed()).count(), 1);

    let signer = Arc::new(|url: &str| {
        Some(format!(
            "https://bucket.store.example/{}",
            url.trim_start_matches("s3://bucket/out/")
        ))
    });

    let uploader = make_uploader(&job, registry_up);
    let downloader = make_downloader(&job, sandbox_dst.path(), true, PluginRegistry::default())
        .with_signer(signer);
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(up.success, "upload failed: {:?}", up.failure);
    assert!(down.success, "download failed: {:?}", down.failure);

    // The plugin saw a signed https URL, not the raw s3 one.
    let handed = std::fs::read_to_string(&witness).unwrap();
    assert_eq!(
        handed.trim(),
        "https://bucket.store.example/obj"
    );

    // The receiver holds a sub-command-7 record for the URL upload and the
    // framed file arrived beside it.
    let reported: Vec<_> = down
        .file_stats
        .iter()
        .filter(|s| s.url.starts_with("https://bucket.store.example/"))
        .collect();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].success);
    assert_eq!(
        std::fs::read(sandbox_dst.path().join("log.txt")).unwrap(),
        b"log line\n"
    );
}

/// A non-final download commits through the tmp-spool: contents rotate
/// into the spool and the staging directories disappear.
#[tokio::test]
async fn transactional_commit_rotates_tmp_spool() {
    let iwd = tempfile::tempdir().unwrap();
    let spool_root = tempfile::tempdir().unwrap();
    let spool = spool_root.path().join("17").join("0");
    std::fs::write(iwd.path().join("input.dat"), b"spooled input").unwrap();

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string())
        .with_str(ATTR_TRANSFER_INPUT_FILES, "input.dat");
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader = make_downloader(&job, &spool, false, PluginRegistry::default());
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(up.success);
    assert!(down.success, "download failed: {:?}", down.failure);
    assert_eq!(
        std::fs::read(spool.join("input.dat")).unwrap(),
        b"spooled input"
    );
    assert_eq!(down.spooled_files, vec!["input.dat".to_string()]);
    assert!(!spool_root.path().join("17").join("0.tmp").exists());
    assert!(!spool_root.path().join("17").join("0.swap").exists());
}

/// Multiple URLs served by one batching plugin are fetched in a single
/// invocation, in submission order.
#[tokio::test]
async fn multifile_plugin_batches_url_fetches() {
    let iwd = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();

    let invocations = tools.path().join("invocations");
    let plugin = script(
        tools.path(),
        "multi_http",
        &format!(
            r#"echo run >> {invocations}
while [ "$1" ]; do
  case "$1" in
    -infile) IN="$2"; shift ;;
    -outfile) OUT="$2"; shift ;;
  esac
  shift
done
: > "$OUT"
sed -n 's/^LocalFileName = "\(.*\)"$/\1/p' "$IN" | while read -r f; do
  echo "fetched" > "$f"
  b=$(basename "$f")
  printf 'TransferFileName = "%s"\nTransferUrl = "http://example/%s"\nTransferSuccess = true\nTransferTotalBytes = 8\n\n' "$b" "$b" >> "$OUT"
done"#,
            invocations = invocations.display()
        ),
    );
    let mut registry = PluginRegistry::default();
    registry.register("http", &plugin, true);

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string()).with_str(
        ATTR_TRANSFER_INPUT_FILES,
        "http://example/one.dat, http://example/two.dat",
    );
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader = make_downloader(&job, sandbox.path(), true, registry);
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(up.success);
    assert!(down.success, "download failed: {:?}", down.failure);
    assert!(sandbox.path().join("one.dat").exists());
    assert!(sandbox.path().join("two.dat").exists());
    // One invocation covered the whole batch.
    assert_eq!(std::fs::read_to_string(&invocations).unwrap().lines().count(), 1);
    assert_eq!(down.file_stats.len(), 2);
    assert_eq!(down.file_stats[0].file_name, "one.dat");
    assert_eq!(down.file_stats[1].file_name, "two.dat");
}

/// A symlink to a file travels as the target's bytes and lands as a
/// regular file.
#[tokio::test]
async fn symlink_to_file_travels_as_bytes() {
    let iwd = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    std::fs::write(iwd.path().join("target.txt"), b"linked content").unwrap();
    std::os::unix::fs::symlink(
        iwd.path().join("target.txt"),
        iwd.path().join("link.txt"),
    )
    .unwrap();

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string())
        .with_str(ATTR_TRANSFER_INPUT_FILES, "link.txt");
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();
    assert!(plan.items[0].is_symlink);

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader = make_downloader(&job, sandbox.path(), true, PluginRegistry::default());
    let (up, down) = run_session(uploader, plan, downloader).await;

    assert!(up.success && down.success);
    let landed = sandbox.path().join("link.txt");
    assert!(std::fs::symlink_metadata(&landed).unwrap().is_file());
    assert_eq!(std::fs::read(&landed).unwrap(), b"linked content");
}

/// Change detection: after a download populates the sandbox, a second
/// upload sends only what changed.
#[tokio::test]
async fn change_detection_round_trip() {
    let iwd = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let return_dir = tempfile::tempdir().unwrap();
    std::fs::write(iwd.path().join("stable.txt"), b"unchanging").unwrap();
    std::fs::write(iwd.path().join("work.txt"), b"initial").unwrap();

    let job = JobRecord::new(17, 0, "alice", &iwd.path().display().to_string())
        .with_str(ATTR_TRANSFER_INPUT_FILES, "stable.txt, work.txt");
    let plan = build_input_plan(&job, iwd.path(), 8).unwrap();

    let uploader = make_uploader(&job, PluginRegistry::default());
    let downloader = make_downloader(&job, sandbox.path(), true, PluginRegistry::default());
    let (up, down) = run_session(uploader, plan, downloader).await;
    assert!(up.success && down.success);

    // Baseline after the download, then the job mutates one file.
    let baseline = stagehand_engine::FileCatalog::build(sandbox.path()).unwrap();
    std::fs::write(sandbox.path().join("work.txt"), b"grew during the run").unwrap();
    std::fs::write(sandbox.path().join("result.out"), b"fresh output").unwrap();

    let out_plan = build_output_plan(&job, sandbox.path(), Some(&baseline), true).unwrap();
    let names: Vec<String> = out_plan.items.iter().map(|i| i.wire_name()).collect();
    assert!(names.contains(&"result.out".to_string()));
    assert!(names.contains(&"work.txt".to_string()));
    assert!(!names.contains(&"stable.txt".to_string()));

    let return_job = JobRecord::new(17, 0, "alice", &sandbox.path().display().to_string());
    let uploader = make_uploader(&return_job, PluginRegistry::default());
    let downloader = make_downloader(&return_job, return_dir.path(), true, PluginRegistry::default());
    let (up, down) = run_session(uploader, out_plan, downloader).await;
    assert!(up.success && down.success);
    assert!(return_dir.path().join("result.out").exists());
    assert!(return_dir.path().join("work.txt").exists());
    assert!(!return_dir.path().join("stable.txt").exists());
}
