//! The built-in Kubernetes crew: a classifier plus four specialists.

use crate::agent::classifier::{CLASSIFIER_WORKER, CLASSIFY_TASK};
use crate::agent::crew::CrewDefinition;
use crate::worker::spec::{OutputContract, WorkerSpec};
use crate::worker::task::TaskSpec;

pub const DEV_AGENT: &str = "DevAgent";
pub const SEC_AGENT: &str = "SecAgent";
pub const OPS_AGENT: &str = "OpsAgent";
pub const ADMIN_AGENT: &str = "AdminAgent";

const CLASSIFIER_OUTPUT: &str = "A JSON array of relevant agents (e.g., [\"DevAgent\", \"SecAgent\"]).";

fn classifier() -> WorkerSpec {
    WorkerSpec::new(
        CLASSIFIER_WORKER,
        "Kubernetes Classifier",
        "Analyze user input and determine which Kubernetes agents should handle the request.",
    )
    .with_backstory(
        "You classify Kubernetes-related requests and return a structured JSON list of \
         relevant agents chosen from: DevAgent, SecAgent, OpsAgent, AdminAgent.",
    )
    .with_output(OutputContract::any(CLASSIFIER_OUTPUT))
}

fn specialists() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec::new(
            DEV_AGENT,
            "Kubernetes Developer",
            "Assist in application deployment within Kubernetes.",
        )
        .with_backstory(
            "You generate Kubernetes YAML manifests for deployments, services, and configurations.",
        )
        .with_tools(["kubectl", "yaml_validator"]),
        WorkerSpec::new(
            SEC_AGENT,
            "Kubernetes Security Expert",
            "Ensure security best practices and compliance.",
        )
        .with_backstory(
            "You review Kubernetes YAML files, secrets, RBAC policies, and security configurations.",
        )
        .with_tools(["yaml_validator"]),
        WorkerSpec::new(
            OPS_AGENT,
            "Kubernetes Operations Expert",
            "Debug, monitor, and optimize Kubernetes operations.",
        )
        .with_backstory(
            "You provide expert-level debugging and operational support for Kubernetes workloads.",
        )
        .with_tools(["kubectl"]),
        WorkerSpec::new(
            ADMIN_AGENT,
            "Kubernetes Administrator",
            "Manage Kubernetes cluster operations, including installation, upgrades, and maintenance.",
        )
        .with_backstory(
            "You handle cluster administration tasks like node scaling, cluster setup, and maintenance.",
        )
        .with_tools(["kubectl"]),
    ]
}

fn tasks() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new(
            "dev_task",
            "Generate Kubernetes YAML manifests for the user's request and validate them.",
            DEV_AGENT,
        )
        .with_output(OutputContract::object(
            "A JSON object containing YAML files, validation results, and a summary.",
        )),
        TaskSpec::new(
            "sec_task",
            "Review the generated YAML files for security best practices.",
            SEC_AGENT,
        )
        .with_output(OutputContract::object(
            "A JSON object containing a security review and recommended fixes.",
        ))
        .depends_on(["dev_task"]),
        TaskSpec::new(
            "ops_task",
            "Provide operational insights and debugging for the Kubernetes request.",
            OPS_AGENT,
        )
        .with_output(OutputContract::object(
            "A JSON object containing operational recommendations.",
        )),
        TaskSpec::new(
            "admin_task",
            "Manage cluster operations for the user's request.",
            ADMIN_AGENT,
        )
        .with_output(OutputContract::object(
            "A JSON object containing cluster administration tasks.",
        )),
    ]
}

/// The Kubernetes crew as registered at startup.
pub fn definition() -> CrewDefinition {
    CrewDefinition {
        classifier: classifier(),
        classify_task: TaskSpec::new(
            CLASSIFY_TASK,
            "Classify the user's Kubernetes request and determine which agents should handle it.",
            CLASSIFIER_WORKER,
        )
        .with_output(OutputContract::any(CLASSIFIER_OUTPUT))
        .with_checkpoint(true),
        workers: specialists(),
        tasks: tasks(),
    }
}
