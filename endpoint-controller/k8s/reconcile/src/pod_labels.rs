use crate::store::NamespaceRecord;
use anyhow::{Context, Result};
use endpoint_controller_core::{Label, Labels};
use endpoint_controller_k8s_api::Pod;
use regex::Regex;

pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
pub const POLICY_CLUSTER_LABEL: &str = "io.cilium.k8s.policy.cluster";
pub const POLICY_SERVICE_ACCOUNT_LABEL: &str = "io.cilium.k8s.policy.serviceaccount";
pub const NAMESPACE_LABELS_PREFIX: &str = "io.cilium.k8s.namespace.labels.";

/// Pod label keys that are set by workload controllers and change across
/// rollouts without changing what the pod is.
pub const DEFAULT_LABEL_EXCLUSIONS: &[&str] = &[
    r"^pod-template-hash$",
    r"^controller-revision-hash$",
    r"^pod-template-generation$",
    r"^controller-uid$",
    r"^job-name$",
    r"^statefulset\.kubernetes\.io/pod-name$",
    r"^batch\.kubernetes\.io/",
];

/// Derives the security labels of a pod.
#[derive(Clone, Debug)]
pub struct LabelConfig {
    cluster_name: String,
    exclusions: Vec<Regex>,
}

impl LabelConfig {
    pub fn new<S: AsRef<str>>(
        cluster_name: impl ToString,
        exclusions: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let exclusions = exclusions
            .into_iter()
            .map(|re| {
                let re = re.as_ref();
                Regex::new(re).with_context(|| format!("invalid label exclusion {re:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cluster_name: cluster_name.to_string(),
            exclusions,
        })
    }

    pub fn with_defaults(cluster_name: impl ToString) -> Result<Self> {
        Self::new(cluster_name, DEFAULT_LABEL_EXCLUSIONS)
    }

    pub fn pod_labels(&self, pod: &Pod, namespace: &NamespaceRecord) -> Labels {
        let mut labels = Labels::default();

        if let Some(pod_labels) = pod.metadata.labels.as_ref() {
            for (k, v) in pod_labels {
                if !self.is_excluded(k) {
                    labels.insert(Label::k8s(k, v));
                }
            }
        }

        labels.insert(Label::k8s(POD_NAMESPACE_LABEL, &namespace.name));
        labels.insert(Label::k8s(POLICY_CLUSTER_LABEL, &self.cluster_name));

        let service_account = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.as_deref())
            .filter(|sa| !sa.is_empty());
        if let Some(sa) = service_account {
            labels.insert(Label::k8s(POLICY_SERVICE_ACCOUNT_LABEL, sa));
        }

        for (k, v) in &namespace.labels {
            labels.insert(Label::k8s(format!("{NAMESPACE_LABELS_PREFIX}{k}"), v));
        }

        labels
    }

    fn is_excluded(&self, key: &str) -> bool {
        self.exclusions.iter().any(|re| re.is_match(key))
    }
}
