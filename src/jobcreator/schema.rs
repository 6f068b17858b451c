//! JSON-Schema validation for user job requests and account lifecycle
//! messages. One schema per cloud; all of them extend the base job shape.

use std::sync::LazyLock;

use jsonschema::Validator;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("support for {0} cloud service not implemented")]
    UnknownCloud(String),

    #[error("job doc is invalid: {0}")]
    Invalid(String),
}

fn base_job_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": "string"},
            "cloud": {"enum": ["ec2", "azure", "gce", "aliyun", "oci"]},
            "requesting_user": {"type": "string", "minLength": 1},
            "last_service": {"type": "string", "minLength": 1},
            "utctime": {"type": "string", "minLength": 1},
            "image": {"type": "string", "minLength": 1},
            "cloud_image_name": {"type": "string", "minLength": 1},
            "image_description": {"type": "string", "minLength": 1},
            "distro": {"type": "string", "minLength": 1},
            "download_url": {"type": "string", "minLength": 1},
            "cloud_architecture": {"enum": ["x86_64", "aarch64"]},
            "tests": {"type": "array", "items": {"type": "string"}},
            "conditions": {"type": "array", "items": {"type": "object"}},
            "cleanup_images": {"type": "boolean"},
            "instance_type": {"type": "string"},
            "old_cloud_image_name": {"type": "string"},
            "profile": {"type": "string"},
            "notification_email": {"type": "string", "format": "email"},
            "notification_type": {"enum": ["single", "periodic"]}
        },
        "required": [
            "cloud", "requesting_user", "last_service", "utctime", "image",
            "cloud_image_name", "image_description", "distro", "download_url"
        ]
    })
}

fn extend(mut base: Value, properties: Value, extra_required: &[&str]) -> Value {
    if let (Some(props), Some(new_props)) = (
        base.pointer_mut("/properties").and_then(Value::as_object_mut),
        properties.as_object(),
    ) {
        for (key, value) in new_props {
            props.insert(key.clone(), value.clone());
        }
    }
    if let Some(required) = base.pointer_mut("/required").and_then(Value::as_array_mut) {
        for key in extra_required {
            required.push(json!(key));
        }
    }
    base
}

fn compile(schema: Value) -> Validator {
    // The schemas above are static and well-formed
    jsonschema::validator_for(&schema)
        .unwrap_or_else(|error| unreachable!("invalid builtin schema: {error}"))
}

static EC2_JOB: LazyLock<Validator> = LazyLock::new(|| {
    compile(extend(
        base_job_schema(),
        json!({
            "cloud_accounts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "region": {"type": "string"},
                        "subnet": {"type": "string"},
                        "root_swap_ami": {"type": "string"}
                    },
                    "required": ["name"]
                },
                "minItems": 1
            },
            "cloud_groups": {"type": "array", "items": {"type": "string"}},
            "use_root_swap": {"type": "boolean"},
            "billing_codes": {"type": "string"}
        }),
        &[],
    ))
});

static AZURE_JOB: LazyLock<Validator> = LazyLock::new(|| {
    compile(extend(
        base_job_schema(),
        json!({
            "cloud_account": {"type": "string", "minLength": 1},
            "region": {"type": "string"},
            "source_container": {"type": "string"},
            "source_resource_group": {"type": "string"},
            "source_storage_account": {"type": "string"},
            "destination_container": {"type": "string"},
            "destination_resource_group": {"type": "string"},
            "destination_storage_account": {"type": "string"}
        }),
        &["cloud_account"],
    ))
});

static GCE_JOB: LazyLock<Validator> = LazyLock::new(|| {
    compile(extend(
        base_job_schema(),
        json!({
            "cloud_account": {"type": "string", "minLength": 1},
            "bucket": {"type": "string"},
            "region": {"type": "string"},
            "family": {"type": "string"},
            "months_to_deletion": {"type": "integer", "minimum": 0},
            "guest_os_features": {
                "type": "array",
                "items": {"type": "string"},
                "uniqueItems": true
            },
            "testing_account": {"type": "string"},
            "image_project": {"type": "string"},
            "test_fallback_regions": {"type": "array", "items": {"type": "string"}}
        }),
        &["cloud_account"],
    ))
});

static ALIYUN_JOB: LazyLock<Validator> = LazyLock::new(|| {
    compile(extend(
        base_job_schema(),
        json!({
            "cloud_account": {"type": "string", "minLength": 1},
            "bucket": {"type": "string"},
            "region": {"type": "string"},
            "security_group_id": {"type": "string"},
            "vswitch_id": {"type": "string"},
            "disk_size": {"type": "integer", "minimum": 5}
        }),
        &["cloud_account"],
    ))
});

static OCI_JOB: LazyLock<Validator> = LazyLock::new(|| {
    compile(extend(
        base_job_schema(),
        json!({
            "cloud_account": {"type": "string", "minLength": 1},
            "bucket": {"type": "string"},
            "region": {"type": "string"},
            "availability_domain": {"type": "string"},
            "compartment_id": {"type": "string"},
            "oci_user_id": {"type": "string"},
            "tenancy": {"type": "string"},
            "operating_system": {"type": "string"},
            "operating_system_version": {"type": "string"}
        }),
        &["cloud_account"],
    ))
});

static ADD_ACCOUNT_EC2: LazyLock<Validator> = LazyLock::new(|| {
    compile(json!({
        "type": "object",
        "properties": {
            "account_name": {"type": "string", "minLength": 1},
            "provider": {"const": "ec2"},
            "requesting_user": {"type": "string", "minLength": 1},
            "partition": {"enum": ["aws", "aws-cn", "aws-us-gov"]},
            "region": {"type": "string", "minLength": 1},
            "additional_regions": {"type": "array", "items": {"type": "object"}},
            "subnet": {"type": "string"},
            "credentials": {
                "type": "object",
                "properties": {
                    "access_key_id": {"type": "string", "minLength": 1},
                    "secret_access_key": {"type": "string", "minLength": 1}
                },
                "required": ["access_key_id", "secret_access_key"]
            },
            "group": {"type": "string"}
        },
        "required": [
            "account_name", "provider", "requesting_user", "region", "credentials"
        ]
    }))
});

static ADD_ACCOUNT_AZURE: LazyLock<Validator> = LazyLock::new(|| {
    compile(json!({
        "type": "object",
        "properties": {
            "account_name": {"type": "string", "minLength": 1},
            "provider": {"const": "azure"},
            "requesting_user": {"type": "string", "minLength": 1},
            "region": {"type": "string", "minLength": 1},
            "source_container": {"type": "string"},
            "source_resource_group": {"type": "string"},
            "source_storage_account": {"type": "string"},
            "credentials": {"type": "object"},
            "group": {"type": "string"}
        },
        "required": [
            "account_name", "provider", "requesting_user", "region", "credentials"
        ]
    }))
});

static DELETE_ACCOUNT: LazyLock<Validator> = LazyLock::new(|| {
    compile(json!({
        "type": "object",
        "properties": {
            "account_name": {"type": "string", "minLength": 1},
            "provider": {"enum": ["ec2", "azure", "gce", "aliyun", "oci"]},
            "requesting_user": {"type": "string", "minLength": 1}
        },
        "required": ["account_name", "provider", "requesting_user"]
    }))
});

fn check(validator: &Validator, instance: &Value) -> Result<(), SchemaError> {
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|error| error.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Invalid(errors.join("; ")))
    }
}

/// Validate a user job request against its cloud's schema.
pub fn validate_job(cloud: &str, doc: &Value) -> Result<(), SchemaError> {
    let validator = match cloud {
        "ec2" => &*EC2_JOB,
        "azure" => &*AZURE_JOB,
        "gce" => &*GCE_JOB,
        "aliyun" => &*ALIYUN_JOB,
        "oci" => &*OCI_JOB,
        other => return Err(SchemaError::UnknownCloud(other.to_string())),
    };
    check(validator, doc)
}

/// Validate an `add_account` message against its provider's schema.
pub fn validate_add_account(provider: &str, message: &Value) -> Result<(), SchemaError> {
    let validator = match provider {
        "ec2" => &*ADD_ACCOUNT_EC2,
        "azure" => &*ADD_ACCOUNT_AZURE,
        other => return Err(SchemaError::UnknownCloud(other.to_string())),
    };
    check(validator, message)
}

pub fn validate_delete_account(message: &Value) -> Result<(), SchemaError> {
    check(&DELETE_ACCOUNT, message)
}
