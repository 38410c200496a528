//! Hyper-V Fleet Provisioner
//!
//! Provisions batches of Windows client VMs on a Hyper-V host for a named
//! tenant. Each VM is cloned from a per-OS reference image, optionally
//! pre-seeded with a zero-touch enrollment config fetched from the tenant's
//! device-management directory, given a virtual TPM, booted and tagged with
//! its hardware serial.
//!
//! # Key Features
//!
//! - **Deterministic naming** - `<tenant>_<n>`, continuing after the highest existing suffix
//! - **Cached inputs** - reference images and enrollment configs are built or fetched once
//! - **Scoped disk mounts** - a mounted disk is always dismounted, even on failure
//! - **Failure isolation** - one VM failing does not stop the rest unless asked to
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hv_fleet::{
//!     FleetCatalog, FleetOrchestrator, HyperV, OperatorPrompt, PolicyFetcher,
//!     ReferenceImageBuilder, ScriptImageBuilder, UnconfiguredDirectory, VmRequest,
//! };
//!
//! let catalog = FleetCatalog::load(r"C:\HyperVFleet\fleet.json")?;
//! let hyperv = Arc::new(HyperV::new(catalog.timeouts)?);
//! let images = ReferenceImageBuilder::new(Box::new(ScriptImageBuilder::new(
//!     catalog.image_builder_script.clone(),
//!     catalog.timeouts.image_build(),
//! )?));
//! let policy = PolicyFetcher::new(Box::new(UnconfiguredDirectory), Box::new(OperatorPrompt));
//! let orchestrator = FleetOrchestrator::new(catalog, hyperv, images, policy);
//!
//! let request = VmRequest::builder("contoso")
//!     .count(3)
//!     .cpu_count(2)
//!     .memory_gb(4)
//!     .build_validated()?;
//!
//! let report = orchestrator.run(&request)?;
//! for record in report.provisioned() {
//!     println!("{} {}", record.name, record.hardware_serial);
//! }
//! # Ok::<(), hv_fleet::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod hyperv;
pub mod image;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod policy;
pub mod provisioner;

pub use config::{FleetCatalog, ImageCatalogEntry, TenantConfig, Timeouts};
pub use error::{Error, ProvisionStep, Result};
pub use graph::{Credentials, DirectoryApi, GraphClient, UnconfiguredDirectory};
pub use hyperv::{HyperV, Hypervisor};
pub use image::{ImageBuilder, ReferenceImageBuilder, ScriptImageBuilder};
pub use models::{FailurePolicy, VmRecord, VmRequest, VmState};
pub use naming::NameAllocator;
pub use orchestrator::{EnrollmentStatus, FleetOrchestrator, FleetReport, VmOutcome};
pub use policy::{AutoSelect, OperatorPrompt, PolicyFetcher, ProfileSelector, RejectAmbiguous};
pub use provisioner::{DeviceProvisioner, ProvisionRequest};
