//! Per-cloud assembly of the stage messages a job fans out as.
//!
//! A `CloudJob` is built once per accepted job from the user request, the
//! account info resolved by the credentials service, and server-resident
//! provider data. It supplies the region/account structures each stage
//! message embeds; the common envelope lives in [`JobBase`].

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::pipeline;

#[derive(Debug, Error)]
pub enum CloudJobError {
    #[error("jobs require a(n) {0} key in the job doc")]
    MissingKey(&'static str),

    #[error("support for {0} cloud service not implemented")]
    UnknownCloud(String),

    #[error("unknown last_service: {0}")]
    Pipeline(#[from] pipeline::PipelineError),
}

/// Fields common to every cloud's job request.
#[derive(Debug, Clone)]
pub struct JobBase {
    pub id: String,
    pub cloud: String,
    pub requesting_user: String,
    pub last_service: &'static str,
    pub utctime: String,
    pub image: String,
    pub cloud_image_name: String,
    pub image_description: String,
    pub distro: String,
    pub download_url: String,
    pub cloud_architecture: String,
    pub tests: Value,
    pub conditions: Option<Value>,
    pub cleanup_images: Option<bool>,
    pub instance_type: Option<String>,
    pub old_cloud_image_name: Option<String>,
    pub notification_email: Option<String>,
    pub notification_type: Option<String>,
    pub profile: Option<String>,
}

impl JobBase {
    fn from_doc(id: &str, doc: &Map<String, Value>) -> Result<Self, CloudJobError> {
        fn required<'a>(
            doc: &'a Map<String, Value>,
            key: &'static str,
        ) -> Result<&'a str, CloudJobError> {
            doc.get(key)
                .and_then(Value::as_str)
                .ok_or(CloudJobError::MissingKey(key))
        }
        fn optional(doc: &Map<String, Value>, key: &str) -> Option<String> {
            doc.get(key).and_then(Value::as_str).map(str::to_owned)
        }

        Ok(Self {
            id: id.to_string(),
            cloud: required(doc, "cloud")?.to_string(),
            requesting_user: required(doc, "requesting_user")?.to_string(),
            last_service: pipeline::normalize(required(doc, "last_service")?)?,
            utctime: required(doc, "utctime")?.to_string(),
            image: required(doc, "image")?.to_string(),
            cloud_image_name: required(doc, "cloud_image_name")?.to_string(),
            image_description: required(doc, "image_description")?.to_string(),
            distro: required(doc, "distro")?.to_string(),
            download_url: required(doc, "download_url")?.to_string(),
            cloud_architecture: optional(doc, "cloud_architecture")
                .unwrap_or_else(|| "x86_64".to_string()),
            tests: doc.get("tests").cloned().unwrap_or_else(|| json!([])),
            conditions: doc.get("conditions").cloned(),
            cleanup_images: doc.get("cleanup_images").and_then(Value::as_bool),
            instance_type: optional(doc, "instance_type"),
            old_cloud_image_name: optional(doc, "old_cloud_image_name"),
            notification_email: optional(doc, "notification_email"),
            notification_type: optional(doc, "notification_type"),
            profile: optional(doc, "profile"),
        })
    }

    /// Envelope fields shared by every stage message of this job.
    fn base_message(&self) -> Map<String, Value> {
        let mut base = Map::new();
        base.insert("id".into(), json!(self.id));
        base.insert("utctime".into(), json!(self.utctime));
        base.insert("last_service".into(), json!(self.last_service));
        if let Some(email) = &self.notification_email {
            base.insert("notification_email".into(), json!(email));
            base.insert(
                "notification_type".into(),
                json!(self.notification_type.as_deref().unwrap_or("single")),
            );
        }
        base
    }
}

/// Region/account structures one cloud contributes to the stage messages.
pub trait CloudJob: Send {
    fn base(&self) -> &JobBase;

    /// Account names whose credentials the pipeline will need.
    fn credentials_accounts(&self) -> Vec<String>;

    /// `{region -> account/config}` for upload, create, raw image upload.
    fn target_regions(&self) -> Value;

    fn test_regions(&self) -> Value;

    fn replication_source_regions(&self) -> Value;

    fn publish_regions(&self) -> Value;

    fn deprecate_regions(&self) -> Value;

    /// Cloud-specific extras appended to one stage's message.
    fn extra_message_fields(&self, _service: &str) -> Map<String, Value> {
        Map::new()
    }
}

impl std::fmt::Debug for dyn CloudJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudJob").finish()
    }
}

/// Build the `{"credentials_job": {...}}` message, always published first.
pub fn credentials_message(job: &dyn CloudJob) -> Vec<u8> {
    let base = job.base();
    let mut payload = base.base_message();
    payload.insert("cloud".into(), json!(base.cloud));
    payload.insert("cloud_accounts".into(), json!(job.credentials_accounts()));
    payload.insert("requesting_user".into(), json!(base.requesting_user));

    let message = json!({ "credentials_job": payload });
    serde_json::to_vec(&message).unwrap_or_default()
}

/// Build the `{"<svc>_job": {...}}` message for one pipeline stage.
pub fn stage_message(job: &dyn CloudJob, service: &str) -> Option<Vec<u8>> {
    let base = job.base();
    let mut payload = base.base_message();
    payload.insert("cloud".into(), json!(base.cloud));
    payload.insert("requesting_user".into(), json!(base.requesting_user));

    match service {
        "obs" => {
            payload.insert("image".into(), json!(base.image));
            payload.insert("download_url".into(), json!(base.download_url));
            payload.insert(
                "cloud_architecture".into(),
                json!(base.cloud_architecture),
            );
            if let Some(conditions) = &base.conditions {
                payload.insert("conditions".into(), conditions.clone());
            }
            if let Some(profile) = &base.profile {
                payload.insert("profile".into(), json!(profile));
            }
        }
        "upload" => {
            payload.insert("cloud_image_name".into(), json!(base.cloud_image_name));
            payload.insert(
                "image_description".into(),
                json!(base.image_description),
            );
            payload.insert(
                "cloud_architecture".into(),
                json!(base.cloud_architecture),
            );
            payload.insert("target_regions".into(), job.target_regions());
        }
        "create" => {
            payload.insert("cloud_image_name".into(), json!(base.cloud_image_name));
            payload.insert(
                "image_description".into(),
                json!(base.image_description),
            );
            payload.insert("distro".into(), json!(base.distro));
            payload.insert(
                "cloud_architecture".into(),
                json!(base.cloud_architecture),
            );
            payload.insert("target_regions".into(), job.target_regions());
        }
        "test" => {
            payload.insert("tests".into(), base.tests.clone());
            payload.insert("distro".into(), json!(base.distro));
            payload.insert("test_regions".into(), job.test_regions());
            payload.insert(
                "cloud_architecture".into(),
                json!(base.cloud_architecture),
            );
            if let Some(instance_type) = &base.instance_type {
                payload.insert("instance_type".into(), json!(instance_type));
            }
            // Conservative cleanup: only when the pipeline ends here and
            // the user did not explicitly opt out
            if base.last_service == "test" && base.cleanup_images != Some(false) {
                payload.insert("cleanup_images".into(), json!(true));
            }
        }
        "raw_image_upload" => {
            payload.insert("cloud_image_name".into(), json!(base.cloud_image_name));
            payload.insert("target_regions".into(), job.target_regions());
        }
        "replicate" => {
            payload.insert("cloud_image_name".into(), json!(base.cloud_image_name));
            payload.insert(
                "replication_source_regions".into(),
                job.replication_source_regions(),
            );
        }
        "publish" => {
            payload.insert("cloud_image_name".into(), json!(base.cloud_image_name));
            payload.insert("publish_regions".into(), job.publish_regions());
        }
        "deprecate" => {
            payload.insert("deprecate_regions".into(), job.deprecate_regions());
            if let Some(old) = &base.old_cloud_image_name {
                payload.insert("old_cloud_image_name".into(), json!(old));
            }
        }
        _ => return None,
    }

    for (key, value) in job.extra_message_fields(service) {
        payload.insert(key, value);
    }

    let mut message = Map::new();
    message.insert(format!("{service}_job"), Value::Object(payload));
    Some(serde_json::to_vec(&Value::Object(message)).unwrap_or_default())
}

/// Instantiate the cloud-specific job for an accepted request.
pub fn create_job(
    id: &str,
    doc: &Map<String, Value>,
    accounts_info: &Value,
    provider_data: &Value,
) -> Result<Box<dyn CloudJob>, CloudJobError> {
    let base = JobBase::from_doc(id, doc)?;
    match base.cloud.as_str() {
        "ec2" => Ok(Box::new(Ec2Job::new(base, doc, accounts_info, provider_data))),
        "azure" | "gce" | "aliyun" | "oci" => {
            Ok(Box::new(SingleAccountJob::new(base, doc, accounts_info)?))
        }
        other => Err(CloudJobError::UnknownCloud(other.to_string())),
    }
}

/// EC2 jobs spread across many accounts and regions. Each account's home
/// region becomes a target region carrying the helper image and the full
/// region list the created AMI replicates to.
struct Ec2Job {
    base: JobBase,
    /// `{region -> {account, partition, regions, helper_image, ...}}`
    target_account_info: Map<String, Value>,
}

impl Ec2Job {
    fn new(
        base: JobBase,
        doc: &Map<String, Value>,
        accounts_info: &Value,
        provider_data: &Value,
    ) -> Self {
        // Per-account overrides submitted with the request
        let mut overrides: Map<String, Value> = Map::new();
        if let Some(accounts) = doc.get("cloud_accounts").and_then(Value::as_array) {
            for account in accounts {
                if let Some(name) = account.get("name").and_then(Value::as_str) {
                    overrides.insert(name.to_string(), account.clone());
                }
            }
        }

        let helper_images = provider_data
            .pointer("/ec2/helper_images")
            .cloned()
            .unwrap_or(Value::Null);

        let mut target_account_info = Map::new();
        if let Some(accounts) = accounts_info.as_object() {
            for (account, info) in accounts {
                let submitted = overrides.get(account);

                let region = submitted
                    .and_then(|acct| acct.get("region"))
                    .or_else(|| info.get("region"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if region.is_empty() {
                    continue;
                }

                let mut regions = vec![json!(region)];
                if let Some(additional) =
                    info.get("additional_regions").and_then(Value::as_array)
                {
                    regions.extend(additional.iter().cloned());
                }

                let mut entry = Map::new();
                entry.insert("account".into(), json!(account));
                entry.insert(
                    "partition".into(),
                    info.get("partition").cloned().unwrap_or(json!("aws")),
                );
                entry.insert("regions".into(), json!(regions));
                entry.insert(
                    "helper_image".into(),
                    helper_images
                        .get(region.as_str())
                        .cloned()
                        .unwrap_or(Value::Null),
                );
                if let Some(subnet) = submitted
                    .and_then(|acct| acct.get("subnet"))
                    .or_else(|| info.get("subnet"))
                {
                    entry.insert("subnet".into(), subnet.clone());
                }
                if let Some(billing_codes) = doc.get("billing_codes") {
                    entry.insert("billing_codes".into(), billing_codes.clone());
                } else {
                    entry.insert("billing_codes".into(), Value::Null);
                }
                entry.insert(
                    "use_root_swap".into(),
                    doc.get("use_root_swap").cloned().unwrap_or(json!(false)),
                );

                target_account_info.insert(region, Value::Object(entry));
            }
        }

        Self {
            base,
            target_account_info,
        }
    }
}

impl CloudJob for Ec2Job {
    fn base(&self) -> &JobBase {
        &self.base
    }

    fn credentials_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .target_account_info
            .values()
            .filter_map(|info| info.get("account").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }

    fn target_regions(&self) -> Value {
        Value::Object(self.target_account_info.clone())
    }

    fn test_regions(&self) -> Value {
        let regions: Map<String, Value> = self
            .target_account_info
            .iter()
            .map(|(region, info)| {
                let mut entry = Map::new();
                entry.insert("account".into(), info.get("account").cloned().unwrap_or_default());
                entry.insert(
                    "partition".into(),
                    info.get("partition").cloned().unwrap_or(json!("aws")),
                );
                if let Some(subnet) = info.get("subnet") {
                    entry.insert("subnet".into(), subnet.clone());
                }
                (region.clone(), Value::Object(entry))
            })
            .collect();
        Value::Object(regions)
    }

    fn replication_source_regions(&self) -> Value {
        let regions: Map<String, Value> = self
            .target_account_info
            .iter()
            .map(|(region, info)| {
                (
                    region.clone(),
                    json!({
                        "account": info.get("account").cloned().unwrap_or_default(),
                        "target_regions": info.get("regions").cloned().unwrap_or(json!([])),
                    }),
                )
            })
            .collect();
        Value::Object(regions)
    }

    fn publish_regions(&self) -> Value {
        self.replication_source_regions()
    }

    fn deprecate_regions(&self) -> Value {
        self.replication_source_regions()
    }
}

/// Azure, GCE, Aliyun and OCI jobs run against one publishing account; the
/// region structures collapse to a single entry plus stage-specific extras.
struct SingleAccountJob {
    base: JobBase,
    account: String,
    region: String,
    account_region_info: Map<String, Value>,
    doc: Map<String, Value>,
}

impl SingleAccountJob {
    fn new(
        base: JobBase,
        doc: &Map<String, Value>,
        accounts_info: &Value,
    ) -> Result<Self, CloudJobError> {
        let account = doc
            .get("cloud_account")
            .and_then(Value::as_str)
            .ok_or(CloudJobError::MissingKey("cloud_account"))?
            .to_string();

        let server_info = accounts_info.get(&account).cloned().unwrap_or(Value::Null);

        let region = doc
            .get("region")
            .or_else(|| server_info.get("region"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // Request fields win over the server-side account record
        let mut info = server_info.as_object().cloned().unwrap_or_default();
        for key in ["bucket", "container", "resource_group", "storage_account"] {
            if let Some(value) = doc.get(key) {
                info.insert(key.to_string(), value.clone());
            }
        }
        info.insert("account".into(), json!(account));

        Ok(Self {
            base,
            account,
            region,
            account_region_info: info,
            doc: doc.clone(),
        })
    }

    fn region_map(&self) -> Value {
        let mut regions = Map::new();
        regions.insert(
            self.region.clone(),
            Value::Object(self.account_region_info.clone()),
        );
        Value::Object(regions)
    }
}

impl CloudJob for SingleAccountJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    fn credentials_accounts(&self) -> Vec<String> {
        let mut accounts = vec![self.account.clone()];
        if let Some(testing) = self.doc.get("testing_account").and_then(Value::as_str) {
            accounts.push(testing.to_string());
        }
        accounts
    }

    fn target_regions(&self) -> Value {
        self.region_map()
    }

    fn test_regions(&self) -> Value {
        let mut regions = self.region_map();
        if let (Some(entry), Some(testing)) = (
            regions
                .get_mut(&self.region)
                .and_then(Value::as_object_mut),
            self.doc.get("testing_account"),
        ) {
            entry.insert("testing_account".into(), testing.clone());
        }
        regions
    }

    fn replication_source_regions(&self) -> Value {
        self.region_map()
    }

    fn publish_regions(&self) -> Value {
        self.region_map()
    }

    fn deprecate_regions(&self) -> Value {
        self.region_map()
    }

    fn extra_message_fields(&self, service: &str) -> Map<String, Value> {
        let mut extras = Map::new();
        let copy = |extras: &mut Map<String, Value>, keys: &[&str]| {
            for key in keys {
                if let Some(value) = self.doc.get(*key) {
                    extras.insert(key.to_string(), value.clone());
                }
            }
        };

        match (self.base.cloud.as_str(), service) {
            ("gce", "create") => copy(&mut extras, &["family", "guest_os_features"]),
            ("gce", "test") => copy(
                &mut extras,
                &["image_project", "testing_account", "test_fallback_regions"],
            ),
            ("gce", "deprecate") => copy(&mut extras, &["months_to_deletion"]),
            ("azure", "upload") => copy(
                &mut extras,
                &[
                    "source_container",
                    "source_resource_group",
                    "source_storage_account",
                ],
            ),
            ("azure", "publish") => copy(
                &mut extras,
                &[
                    "destination_container",
                    "destination_resource_group",
                    "destination_storage_account",
                ],
            ),
            ("aliyun", "upload") => copy(&mut extras, &["bucket", "disk_size"]),
            ("aliyun", "test") => copy(&mut extras, &["security_group_id", "vswitch_id"]),
            ("oci", "upload") => copy(&mut extras, &["bucket", "tenancy", "compartment_id"]),
            ("oci", "create") => copy(
                &mut extras,
                &["operating_system", "operating_system_version"],
            ),
            _ => {}
        }
        extras
    }
}
