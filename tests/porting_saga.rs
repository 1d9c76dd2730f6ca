mod common;

use std::sync::Arc;

use common::{HarnessBuilder, PROPOSAL_URL};
use spaghettihub::porting::{MergeOutcome, PortingService};
use spaghettihub_common::WorkStatus;

fn service(h: &common::Harness) -> PortingService {
    PortingService::new(h.store.clone(), h.engine.clone(), h.engine.task_queue())
}

#[tokio::test]
async fn test_clean_merge_opens_pull_request() {
    let h = HarnessBuilder::new().build();
    let work = service(&h).request(PROPOSAL_URL).await.unwrap();
    assert_eq!(work.status, WorkStatus::New);
    let uuid = work.request_uuid.clone();

    let status: WorkStatus = h
        .engine
        .result(&format!("launchpad-to-github-{}", uuid))
        .await
        .unwrap();
    assert_eq!(status, WorkStatus::Completed);

    assert_eq!(
        h.vcs.calls(),
        vec![
            "sync_fork".to_string(),
            format!("merge {} fix-dhcp", uuid),
            format!("push {}", uuid),
        ]
    );
    let prs = h.github.pull_requests.lock().unwrap().clone();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].title, "Launchpad MP (451234) - jane/fix-dhcp");
    assert_eq!(prs[0].head, format!("r00tabot:{}", uuid));

    let record = service(&h).status(&uuid).await.unwrap().unwrap();
    assert_eq!(record.status, WorkStatus::Completed);
    assert_eq!(
        record.github_url.as_deref(),
        Some("https://github.com/canonical/maas/pull/1")
    );
    assert!(record.completed_at.is_some());
    assert_eq!(
        h.phase(&format!("launchpad-to-github-{}", uuid)).await.as_deref(),
        Some("COMPLETED")
    );
}

#[tokio::test]
async fn test_conflict_falls_back_to_patch() {
    let h = HarnessBuilder::new()
        .merge_outcome(MergeOutcome::Conflicted)
        .build();
    let uuid = service(&h).request(PROPOSAL_URL).await.unwrap().request_uuid;

    let status: WorkStatus = h
        .engine
        .result(&format!("launchpad-to-github-{}", uuid))
        .await
        .unwrap();
    assert_eq!(status, WorkStatus::Completed);

    let calls = h.vcs.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[1], format!("merge {} fix-dhcp", uuid));
    assert_eq!(calls[2], format!("patch {} Fix DHCP leases", uuid));
    assert_eq!(calls[3], format!("push {}", uuid));
    assert_eq!(h.github.pull_requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_diff_failure_marks_request_failed() {
    let h = HarnessBuilder::new().failing_launchpad().build();
    let uuid = service(&h).request(PROPOSAL_URL).await.unwrap().request_uuid;

    let status: WorkStatus = h
        .engine
        .result(&format!("launchpad-to-github-{}", uuid))
        .await
        .unwrap();
    assert_eq!(status, WorkStatus::Failed);

    let record = service(&h).status(&uuid).await.unwrap().unwrap();
    assert_eq!(record.status, WorkStatus::Failed);
    assert!(record.github_url.is_none());
    assert!(h.vcs.calls().is_empty());
    assert!(h.github.pull_requests.lock().unwrap().is_empty());
    assert_eq!(
        h.phase(&format!("launchpad-to-github-{}", uuid)).await.as_deref(),
        Some("FAILED")
    );
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let h = HarnessBuilder::new().build();
    let svc = Arc::new(service(&h));
    let (a, b) = tokio::join!(svc.request(PROPOSAL_URL), svc.request(PROPOSAL_URL));
    let (a, b) = (a.unwrap().request_uuid, b.unwrap().request_uuid);
    assert_ne!(a, b);

    for uuid in [&a, &b] {
        let status: WorkStatus = h
            .engine
            .result(&format!("launchpad-to-github-{}", uuid))
            .await
            .unwrap();
        assert_eq!(status, WorkStatus::Completed);
    }
    assert_eq!(h.github.pull_requests.lock().unwrap().len(), 2);
}
