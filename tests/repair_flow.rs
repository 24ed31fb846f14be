//! Corruption handling and repair orchestration end to end

mod common;

use common::{
    FakeRepairTool, MockNntpServer, PostedFile, ServerScript, assert_file_content, count_events, create_nzb,
    drain_events, local_config, test_payload,
};
use newsweave::{Client, Error, Event, Manifest, RepairStatus};
use std::sync::Arc;

fn par_files(base: &str, blocks: u32) -> Vec<PostedFile> {
    vec![
        PostedFile::new(&format!("{}.par2", base), test_payload(600, 40), 600),
        PostedFile::new(&format!("{}.vol00+{:02}.par2", base, blocks), test_payload(900, 41), 600),
    ]
}

#[tokio::test]
async fn missing_segment_is_repaired_and_stream_completes() {
    let data = PostedFile::new("show.bin", test_payload(5 * 1000, 11), 1000);
    let pars = par_files("show", 1);

    let mut script = ServerScript::default();
    data.post(&mut script, &[2]);
    for par in &pars {
        par.post(&mut script, &[]);
    }
    let server = MockNntpServer::start(script).await;

    let (config, temp) = local_config(server.port(), 2);
    let tool = Arc::new(FakeRepairTool::restoring([("show.bin".to_string(), data.data.clone())]));
    let client = Client::with_repair_tool(config, tool.clone());
    let mut events = client.subscribe();

    let specs: Vec<_> = std::iter::once(data.spec()).chain(pars.iter().map(PostedFile::spec)).collect();
    let nzb = create_nzb("Show", &specs);
    let manifest = Manifest::parse(&client, nzb.as_bytes(), "show").unwrap();
    assert_eq!(manifest.par_count(), 2);
    assert_eq!(manifest.max_repairable_segments(), 1);

    let out_dir = temp.path().join("out");
    let reports = manifest.download(&out_dir).await.unwrap();

    assert_eq!(reports.len(), 1);
    let (name, report) = &reports[0];
    assert_eq!(name, "show.bin");
    assert!(report.repaired);
    assert_eq!(report.corrupted_segments, 1);
    assert_file_content(&out_dir.join("show.bin"), &data.data);

    let file = manifest.file("show.bin").unwrap();
    assert_eq!(
        file.repair_status(),
        RepairStatus::Repaired(manifest.repair_dir().join("show.bin"))
    );
    assert_eq!(tool.calls(), vec![manifest.repair_dir().join("show.par2")]);
    assert_file_content(&manifest.repair_dir().join("show.par2"), &pars[0].data);

    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, |e| matches!(e, Event::NeedsRepair { .. })), 1);
    assert_eq!(count_events(&events, |e| matches!(e, Event::RepairStarted { .. })), 1);
    assert_eq!(count_events(&events, |e| matches!(e, Event::FileRepaired { .. })), 1);
    assert!(count_events(&events, |e| matches!(e, Event::RepairProgress { .. })) >= 1);
    assert_eq!(count_events(&events, |e| matches!(e, Event::Broken { .. })), 0);
    client.close().await;
}

#[tokio::test]
async fn damage_beyond_capacity_breaks_manifest_once() {
    let first = PostedFile::new("a.bin", test_payload(4000, 21), 1000);
    let second = PostedFile::new("b.bin", test_payload(4000, 22), 1000);
    let pars = par_files("set", 1);

    let mut script = ServerScript::default();
    first.post(&mut script, &[1]);
    second.post(&mut script, &[0, 2]);
    for par in &pars {
        par.post(&mut script, &[]);
    }
    let server = MockNntpServer::start(script).await;

    let (config, temp) = local_config(server.port(), 3);
    let tool = Arc::new(FakeRepairTool::restoring([
        ("a.bin".to_string(), first.data.clone()),
        ("b.bin".to_string(), second.data.clone()),
    ]));
    let client = Client::with_repair_tool(config, tool);
    let mut events = client.subscribe();

    let mut specs = vec![first.spec(), second.spec()];
    specs.extend(pars.iter().map(PostedFile::spec));
    let nzb = create_nzb("Set", &specs);
    let manifest = Manifest::parse(&client, nzb.as_bytes(), "set").unwrap();

    let err = manifest.download(temp.path().join("out")).await.unwrap_err();
    assert!(matches!(err, Error::RepairExhausted(_)), "got {:?}", err);
    assert!(manifest.is_broken());
    assert!(manifest.broken_segments() > 1);

    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, |e| matches!(e, Event::Broken { .. })), 1);
    client.close().await;
}

#[tokio::test]
async fn corruption_without_repair_files_breaks_manifest() {
    let data = PostedFile::new("lonely.bin", test_payload(3000, 5), 1000);
    let mut script = ServerScript::default();
    data.post(&mut script, &[0]);
    let server = MockNntpServer::start(script).await;

    let (config, temp) = local_config(server.port(), 1);
    let client = Client::with_repair_tool(config, Arc::new(FakeRepairTool::failing()));
    let mut events = client.subscribe();
    let nzb = create_nzb("Lonely", &[data.spec()]);
    let manifest = Manifest::parse(&client, nzb.as_bytes(), "lonely").unwrap();
    assert_eq!(manifest.max_repairable_segments(), 0);

    let err = manifest.download(temp.path().join("out")).await.unwrap_err();
    assert!(matches!(err, Error::RepairExhausted(_)), "got {:?}", err);

    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, |e| matches!(e, Event::Broken { .. })), 1);
    assert_eq!(count_events(&events, |e| matches!(e, Event::RepairStarted { .. })), 0);
    client.close().await;
}

#[tokio::test]
async fn failed_repair_breaks_manifest() {
    let data = PostedFile::new("movie.bin", test_payload(3000, 8), 1000);
    let pars = par_files("movie", 2);

    let mut script = ServerScript::default();
    data.post(&mut script, &[1]);
    for par in &pars {
        par.post(&mut script, &[]);
    }
    let server = MockNntpServer::start(script).await;

    let (config, temp) = local_config(server.port(), 2);
    let client = Client::with_repair_tool(config, Arc::new(FakeRepairTool::failing()));
    let mut events = client.subscribe();
    let specs: Vec<_> = std::iter::once(data.spec()).chain(pars.iter().map(PostedFile::spec)).collect();
    let nzb = create_nzb("Movie", &specs);
    let manifest = Manifest::parse(&client, nzb.as_bytes(), "movie").unwrap();

    let err = manifest.download(temp.path().join("out")).await.unwrap_err();
    assert!(matches!(err, Error::RepairExhausted(_)), "got {:?}", err);
    assert_eq!(
        manifest.file("movie.bin").unwrap().repair_status(),
        RepairStatus::Broken
    );

    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, |e| matches!(e, Event::RepairStarted { .. })), 1);
    assert_eq!(count_events(&events, |e| matches!(e, Event::Broken { .. })), 1);
    client.close().await;
}
