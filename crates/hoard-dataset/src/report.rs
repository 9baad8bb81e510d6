//! Cache-worker reports exchanged through a per-dataset ConfigMap
//!
//! Workers write `<dataset>-cache-report` in the dataset's namespace:
//!
//! ```text
//! total: 50Gi
//! ufsTotal: 50Gi
//! cacheable: 40Gi
//! node.worker-1: 10Gi
//! node.worker-2: 5Gi
//! ```
//!
//! On deletion the controller sets `releaseRequested: "true"`; workers drop
//! their copies and answer with `released: "true"`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use hoard_common::crd::Dataset;
use hoard_common::quantity::ByteQuantity;
use hoard_common::{Error, Result};

use crate::observation::{
    CacheTeardown, MountObservation, MountStatusProvider, NodeCacheReport, TeardownState,
};

/// Suffix appended to the dataset name to form the report ConfigMap name
pub const REPORT_SUFFIX: &str = "-cache-report";

/// Label workers put on report ConfigMaps
pub const REPORT_LABEL: &str = "data.hoard.dev/cache-report";

/// Label selector matching report ConfigMaps
pub const REPORT_SELECTOR: &str = "data.hoard.dev/cache-report=true";

const KEY_TOTAL: &str = "total";
const KEY_UFS_TOTAL: &str = "ufsTotal";
const KEY_CACHEABLE: &str = "cacheable";
const KEY_NODE_PREFIX: &str = "node.";
const KEY_RELEASE_REQUESTED: &str = "releaseRequested";
const KEY_RELEASED: &str = "released";

const MOUNT_STATUS: &str = "mount-status";
const TEARDOWN: &str = "teardown";

/// Name of the report ConfigMap for a dataset
pub fn report_name(dataset: &str) -> String {
    format!("{}{}", dataset, REPORT_SUFFIX)
}

/// Dataset a report ConfigMap belongs to, for mapping watch events
pub fn report_owner(cm: &ConfigMap) -> Option<ObjectRef<Dataset>> {
    let name = cm.name_any();
    let dataset = name.strip_suffix(REPORT_SUFFIX).filter(|n| !n.is_empty())?;
    let namespace = cm.namespace()?;
    Some(ObjectRef::new(dataset).within(&namespace))
}

/// Totals and per-node bytes parsed from a report
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedReport {
    /// Discovered logical size
    pub total: ByteQuantity,
    /// Source filesystem size (defaults to `total`)
    pub ufs_total: ByteQuantity,
    /// Bytes eligible for caching
    pub cacheable: ByteQuantity,
    /// Cached bytes by node name
    pub nodes: BTreeMap<String, ByteQuantity>,
}

fn quantity(data: &BTreeMap<String, String>, key: &str) -> Result<Option<ByteQuantity>> {
    data.get(key)
        .map(|raw| ByteQuantity::parse(raw.trim()))
        .transpose()
}

/// Parse report data; `None` until the workers have written `total`
pub fn parse_report(data: &BTreeMap<String, String>) -> Result<Option<ParsedReport>> {
    let Some(total) = quantity(data, KEY_TOTAL)? else {
        return Ok(None);
    };
    let cacheable = quantity(data, KEY_CACHEABLE)?.ok_or_else(|| {
        Error::collaborator_permanent(MOUNT_STATUS, "report has 'total' but no 'cacheable'")
    })?;
    let ufs_total = quantity(data, KEY_UFS_TOTAL)?.unwrap_or(total);

    let mut nodes = BTreeMap::new();
    for (key, raw) in data {
        if let Some(node) = key.strip_prefix(KEY_NODE_PREFIX) {
            if node.is_empty() {
                return Err(Error::collaborator_permanent(
                    MOUNT_STATUS,
                    "node report key without a node name",
                ));
            }
            nodes.insert(node.to_string(), ByteQuantity::parse(raw.trim())?);
        }
    }

    Ok(Some(ParsedReport {
        total,
        ufs_total,
        cacheable,
        nodes,
    }))
}

fn kube_failure(context: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if (400..500).contains(&ae.code) => {
            Error::collaborator_permanent(context, err.to_string())
        }
        _ => Error::collaborator(context, err.to_string()),
    }
}

/// Mount status and teardown through report ConfigMaps
#[derive(Clone)]
pub struct ConfigMapReports {
    client: Client,
}

impl ConfigMapReports {
    /// Reports read and written with `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn configmaps(&self, dataset: &Dataset) -> Api<ConfigMap> {
        Api::namespaced(
            self.client.clone(),
            &dataset.namespace().unwrap_or_default(),
        )
    }

    async fn read_report(&self, dataset: &Dataset, context: &str) -> Result<Option<ConfigMap>> {
        self.configmaps(dataset)
            .get_opt(&report_name(&dataset.name_any()))
            .await
            .map_err(|e| kube_failure(context, e))
    }
}

#[async_trait]
impl MountStatusProvider for ConfigMapReports {
    async fn observe(&self, dataset: &Dataset) -> Result<Option<MountObservation>> {
        let Some(cm) = self.read_report(dataset, MOUNT_STATUS).await? else {
            return Ok(None);
        };
        let Some(parsed) = parse_report(&cm.data.unwrap_or_default())? else {
            return Ok(None);
        };

        let nodes_api: Api<Node> = Api::all(self.client.clone());
        let mut nodes = Vec::with_capacity(parsed.nodes.len());
        for (node, cached) in parsed.nodes {
            match nodes_api.get_opt(&node).await {
                Ok(Some(n)) => nodes.push(NodeCacheReport {
                    labels: n.labels().clone(),
                    node,
                    cached,
                }),
                Ok(None) => {
                    debug!(node = %node, "ignoring report from node that no longer exists");
                }
                Err(e) => return Err(kube_failure(MOUNT_STATUS, e)),
            }
        }

        Ok(Some(MountObservation {
            total: parsed.total,
            ufs_total: parsed.ufs_total,
            cacheable: parsed.cacheable,
            nodes,
        }))
    }
}

/// Teardown state recorded in report data
pub fn teardown_state(data: &BTreeMap<String, String>) -> TeardownState {
    if data.get(KEY_RELEASED).map(String::as_str) == Some("true") {
        TeardownState::Released
    } else {
        TeardownState::Pending
    }
}

#[async_trait]
impl CacheTeardown for ConfigMapReports {
    async fn release(&self, dataset: &Dataset) -> Result<TeardownState> {
        let Some(cm) = self.read_report(dataset, TEARDOWN).await? else {
            return Ok(TeardownState::Released);
        };
        let data = cm.data.unwrap_or_default();
        if teardown_state(&data) == TeardownState::Released {
            return Ok(TeardownState::Released);
        }

        if data.get(KEY_RELEASE_REQUESTED).map(String::as_str) != Some("true") {
            let patch = json!({ "data": { KEY_RELEASE_REQUESTED: "true" } });
            self.configmaps(dataset)
                .patch(
                    &report_name(&dataset.name_any()),
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await
                .map_err(|e| kube_failure(TEARDOWN, e))?;
            info!(dataset = %dataset.key(), "requested cache release from workers");
        }
        Ok(TeardownState::Pending)
    }
}
