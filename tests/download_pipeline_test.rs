//! Completion polling followed by routing, with a simulated browser writing
//! into the working directory.

use ppmi_downloader::{
    CompletionPoller, DownloadTask, ExtensionSet, FileRouter, Logger, PpmiError, RoutedFile,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn task(accepted: ExtensionSet, expected: usize, timeout: Duration, destination: PathBuf) -> DownloadTask {
    DownloadTask::new(
        vec![],
        accepted,
        expected,
        timeout,
        Duration::from_secs(1),
        destination,
    )
    .unwrap()
}

/// Write `name` as `<name>.crdownload`, then rename it once `delay` has passed.
fn spawn_download(dir: PathBuf, name: &'static str, content: &'static [u8], delay: Duration) {
    let partial = dir.join(format!("{}.crdownload", name));
    std::fs::write(&partial, &content[..content.len() / 2]).unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        std::fs::write(&partial, content).unwrap();
        std::fs::rename(&partial, dir.join(name)).unwrap();
    });
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_rename_then_routes() -> anyhow::Result<()> {
    let workdir = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    let task = task(
        ExtensionSet::metadata(),
        1,
        Duration::from_secs(30),
        destination.path().join("study"),
    );

    spawn_download(
        workdir.path().to_path_buf(),
        "Demographics.csv",
        b"PATNO,SEX\n3001,1\n",
        Duration::from_millis(3500),
    );

    let start = tokio::time::Instant::now();
    let names = CompletionPoller::new(Logger::silent())
        .wait(workdir.path(), &task, &CancellationToken::new())
        .await?;

    assert_eq!(names, vec!["Demographics.csv"]);
    // Noticed on the first tick after the rename
    assert_eq!(start.elapsed(), Duration::from_secs(4));

    let routed = FileRouter::new(task.accepted.clone(), Logger::silent()).route(
        workdir.path(),
        &names,
        &task.destination,
    )?;

    assert_eq!(
        routed,
        vec![RoutedFile::Moved {
            name: "Demographics.csv".to_string(),
            path: destination.path().join("study/Demographics.csv"),
        }]
    );
    assert_eq!(
        std::fs::read_to_string(destination.path().join("study/Demographics.csv"))?,
        "PATNO,SEX\n3001,1\n"
    );
    assert_eq!(std::fs::read_dir(workdir.path())?.count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_waits_until_every_expected_file_lands() -> anyhow::Result<()> {
    let workdir = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    let task = task(
        ExtensionSet::imaging(),
        2,
        Duration::from_secs(60),
        destination.path().to_path_buf(),
    );

    spawn_download(
        workdir.path().to_path_buf(),
        "images_metadata.csv",
        b"Subject\n3001\n",
        Duration::from_secs(1),
    );
    // The second file only starts once the first is done
    let dir = workdir.path().to_path_buf();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        std::fs::write(dir.join("images_metadata.xml"), b"<project/>").unwrap();
    });

    let start = tokio::time::Instant::now();
    let names = CompletionPoller::new(Logger::silent())
        .wait(workdir.path(), &task, &CancellationToken::new())
        .await?;

    assert_eq!(names, vec!["images_metadata.csv", "images_metadata.xml"]);
    assert!(start.elapsed() >= Duration::from_secs(5));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_format_leaves_files_in_place() -> anyhow::Result<()> {
    let workdir = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    std::fs::write(workdir.path().join("Demographics.csv"), b"x")?;
    std::fs::write(workdir.path().join("viewer.exe"), b"MZ")?;
    let task = task(
        ExtensionSet::metadata(),
        1,
        Duration::from_secs(5),
        destination.path().to_path_buf(),
    );

    let names = CompletionPoller::new(Logger::silent())
        .wait(workdir.path(), &task, &CancellationToken::new())
        .await?;
    assert_eq!(names, vec!["Demographics.csv", "viewer.exe"]);

    let err = FileRouter::new(task.accepted.clone(), Logger::silent())
        .route(workdir.path(), &names, &task.destination)
        .unwrap_err();

    match err {
        PpmiError::FormatError { file, accepted } => {
            assert_eq!(file, "viewer.exe");
            assert_eq!(accepted, ".csv, .zip");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(workdir.path().join("Demographics.csv").exists());
    assert_eq!(std::fs::read_dir(destination.path())?.count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stalled_download_times_out() -> anyhow::Result<()> {
    let workdir = tempfile::tempdir()?;
    std::fs::write(workdir.path().join("Demographics.csv.crdownload"), b"half")?;
    let task = task(
        ExtensionSet::metadata(),
        1,
        Duration::from_secs(3),
        workdir.path().join("out"),
    );

    let err = CompletionPoller::new(Logger::silent())
        .wait(workdir.path(), &task, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        PpmiError::DownloadTimeout {
            waited,
            in_progress,
            finished,
            ..
        } => {
            assert_eq!(waited, Duration::from_secs(3));
            assert_eq!(in_progress, vec!["Demographics.csv.crdownload"]);
            assert!(finished.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_the_wait() -> anyhow::Result<()> {
    let workdir = tempfile::tempdir()?;
    let task = task(
        ExtensionSet::metadata(),
        1,
        Duration::from_secs(600),
        workdir.path().join("out"),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });

    let start = tokio::time::Instant::now();
    let err = CompletionPoller::new(Logger::silent())
        .wait(workdir.path(), &task, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PpmiError::Cancelled));
    assert_eq!(start.elapsed(), Duration::from_millis(2500));
    Ok(())
}
