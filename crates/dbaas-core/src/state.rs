//! Cluster state resolution
//!
//! Collapses a stored document and an image-match probe into a [`ClusterState`].
//! The table is evaluated top to bottom; the first matching row wins:
//!
//! | # | condition                                          | state       |
//! |---|----------------------------------------------------|-------------|
//! | 1 | no document, or document without spec              | `Invalid`   |
//! | 2 | probe fails                                        | `Invalid`   |
//! | 3 | pause requested, status `ready` or `paused`        | `Paused`    |
//! | 4 | pause requested, any other status                  | `Changing`  |
//! | 5 | running pods do not match the declared image       | `Upgrading` |
//! | 6 | status `ready`                                     | `Ready`     |
//! | 7 | anything else, unrecognized statuses included      | `Changing`  |

use crate::cluster::{AppState, ClusterState, DatabaseCluster};

/// Resolve the externally visible state of a cluster
///
/// `image_matches` reports whether the running pods carry the image declared
/// in the document. It is only invoked when the document has a spec.
pub fn resolve<C, P, E>(cluster: Option<&C>, image_matches: P) -> ClusterState
where
    C: DatabaseCluster + ?Sized,
    P: FnOnce(&C) -> Result<bool, E>,
{
    let Some(cluster) = cluster else {
        return ClusterState::Invalid;
    };
    let Some(pause) = cluster.pause() else {
        return ClusterState::Invalid;
    };
    let Ok(matches) = image_matches(cluster) else {
        return ClusterState::Invalid;
    };

    let state = cluster.state();
    if pause {
        return match state {
            AppState::Ready | AppState::Paused => ClusterState::Paused,
            _ => ClusterState::Changing,
        };
    }

    if !matches {
        return ClusterState::Upgrading;
    }

    match state {
        AppState::Ready => ClusterState::Ready,
        _ => ClusterState::Changing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCluster {
        pause: Option<bool>,
        state: AppState,
    }

    impl DatabaseCluster for FakeCluster {
        fn name(&self) -> &str {
            "fake"
        }

        fn pause(&self) -> Option<bool> {
            self.pause
        }

        fn image(&self) -> Option<&str> {
            Some("percona/percona-xtradb-cluster:8.0.27")
        }

        fn state(&self) -> AppState {
            self.state.clone()
        }
    }

    fn cluster(pause: bool, state: &str) -> FakeCluster {
        FakeCluster {
            pause: Some(pause),
            state: AppState::parse(Some(state)),
        }
    }

    fn matching(_: &FakeCluster) -> Result<bool, ()> {
        Ok(true)
    }

    fn mismatching(_: &FakeCluster) -> Result<bool, ()> {
        Ok(false)
    }

    #[test]
    fn test_absent_document_is_invalid() {
        assert_eq!(resolve(None::<&FakeCluster>, matching), ClusterState::Invalid);
    }

    #[test]
    fn test_missing_spec_is_invalid() {
        let c = FakeCluster {
            pause: None,
            state: AppState::Ready,
        };
        assert_eq!(resolve(Some(&c), matching), ClusterState::Invalid);
    }

    #[test]
    fn test_missing_spec_does_not_probe() {
        let c = FakeCluster {
            pause: None,
            state: AppState::Ready,
        };
        let state = resolve(Some(&c), |_: &FakeCluster| -> Result<bool, ()> {
            panic!("probe must not run without a spec")
        });
        assert_eq!(state, ClusterState::Invalid);
    }

    #[test]
    fn test_probe_failure_is_invalid() {
        let failing = |_: &FakeCluster| Err::<bool, &str>("pods unavailable");
        for c in [cluster(false, "ready"), cluster(true, "paused")] {
            assert_eq!(resolve(Some(&c), failing), ClusterState::Invalid);
        }
    }

    #[test]
    fn test_paused_rows() {
        assert_eq!(resolve(Some(&cluster(true, "ready")), matching), ClusterState::Paused);
        assert_eq!(resolve(Some(&cluster(true, "paused")), matching), ClusterState::Paused);
        assert_eq!(
            resolve(Some(&cluster(true, "ready")), mismatching),
            ClusterState::Paused
        );
        for status in ["stopping", "initializing", "error", "", "something-new"] {
            assert_eq!(
                resolve(Some(&cluster(true, status)), matching),
                ClusterState::Changing,
                "pause=true status={status}"
            );
        }
    }

    #[test]
    fn test_image_mismatch_is_upgrading() {
        for status in ["ready", "initializing", "error", "paused"] {
            assert_eq!(
                resolve(Some(&cluster(false, status)), mismatching),
                ClusterState::Upgrading,
                "status={status}"
            );
        }
    }

    #[test]
    fn test_ready_and_fallthrough() {
        assert_eq!(resolve(Some(&cluster(false, "ready")), matching), ClusterState::Ready);
        for status in ["initializing", "paused", "stopping", "error", "", "resharding"] {
            assert_eq!(
                resolve(Some(&cluster(false, status)), matching),
                ClusterState::Changing,
                "status={status}"
            );
        }
    }

    #[test]
    fn test_full_table() {
        let statuses = ["ready", "paused", "stopping", "initializing", "error", "unknown", "new"];
        for pause in [true, false] {
            for status in statuses {
                for image_match in [true, false] {
                    let c = cluster(pause, status);
                    let got = resolve(Some(&c), |_: &FakeCluster| Ok::<_, ()>(image_match));
                    let expected = match (pause, status, image_match) {
                        (true, "ready" | "paused", _) => ClusterState::Paused,
                        (true, _, _) => ClusterState::Changing,
                        (false, _, false) => ClusterState::Upgrading,
                        (false, "ready", true) => ClusterState::Ready,
                        (false, _, true) => ClusterState::Changing,
                    };
                    assert_eq!(got, expected, "pause={pause} status={status} match={image_match}");
                }
            }
        }
    }

    #[test]
    fn test_resolve_typed_document() {
        let value = serde_json::json!({
            "apiVersion": "pxc.percona.com/v1",
            "kind": "PerconaXtraDBCluster",
            "metadata": {"name": "orders"},
            "spec": {"pxc": {"size": 3}},
            "status": {"state": "ready"}
        });
        let cluster =
            crate::cluster::AnyCluster::from_value(crate::params::Engine::XtraDb, value).unwrap();
        let state = resolve(Some(&cluster), |_| Ok::<_, ()>(true));
        assert_eq!(state, ClusterState::Ready);
    }
}
