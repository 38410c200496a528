//! hv-fleet CLI - provision tenant VM fleets on a Hyper-V host

use clap::{Args, Parser, Subcommand, ValueEnum};
use hv_fleet::config::DEFAULT_CATALOG_PATH;
use hv_fleet::models::{FailurePolicy, DEFAULT_MEMORY_BYTES, GIB};
use hv_fleet::{
    AutoSelect, Credentials, DirectoryApi, FleetCatalog, FleetOrchestrator, FleetReport,
    GraphClient, HyperV, ImageCatalogEntry, OperatorPrompt, PolicyFetcher, ProfileSelector,
    ReferenceImageBuilder, RejectAmbiguous, Result, ScriptImageBuilder, TenantConfig,
    UnconfiguredDirectory, VmOutcome, VmRequest,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hv-fleet")]
#[command(about = "Provision Autopilot-ready Hyper-V client VMs per tenant")]
#[command(version)]
struct Cli {
    /// Path to the catalog file
    #[arg(long, global = true, env = "HV_FLEET_CONFIG", default_value = DEFAULT_CATALOG_PATH)]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision VMs for a tenant
    Provision(ProvisionArgs),
    /// Write a new, empty catalog
    Init {
        /// Root directory for tenant workspaces
        #[arg(long)]
        vm_path: PathBuf,
        /// Virtual switch new VMs connect to
        #[arg(long)]
        switch: String,
        /// VLAN id applied to every VM adapter
        #[arg(long)]
        vlan: Option<u16>,
    },
    /// Tenant catalog management
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },
    /// Image catalog management
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },
    /// Show the catalog
    Show,
}

#[derive(Args)]
struct ProvisionArgs {
    /// Tenant name from the catalog
    #[arg(short, long)]
    tenant: String,
    /// Image to use instead of the tenant's default
    #[arg(long)]
    os_build: Option<String>,
    /// Number of VMs to create
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..=999))]
    count: u32,
    /// Virtual processors per VM
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=999))]
    cpus: u32,
    /// Startup memory per VM in GiB
    #[arg(long, default_value_t = DEFAULT_MEMORY_BYTES / GIB, value_parser = clap::value_parser!(u64).range(2..=20))]
    memory_gb: u64,
    /// Do not fetch or inject an enrollment config
    #[arg(long)]
    skip_enrollment: bool,
    /// Show what would be done without changing anything
    #[arg(long)]
    dry_run: bool,
    /// Stop at the first VM that fails
    #[arg(long)]
    fail_fast: bool,
    /// How to choose between several enrollment profiles
    #[arg(long, value_enum, default_value_t = SelectMode::Prompt)]
    select: SelectMode,
    #[command(flatten)]
    credentials: CredentialArgs,
}

#[derive(Args)]
struct CredentialArgs {
    /// Bearer token for the directory API
    #[arg(long, env = "HV_FLEET_GRAPH_TOKEN", hide_env_values = true)]
    graph_token: Option<String>,
    /// Directory tenant id for the client-credentials grant
    #[arg(long, env = "HV_FLEET_DIRECTORY_TENANT")]
    directory_tenant: Option<String>,
    #[arg(long, env = "HV_FLEET_CLIENT_ID")]
    client_id: Option<String>,
    #[arg(long, env = "HV_FLEET_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
}

impl CredentialArgs {
    fn into_credentials(self) -> Option<Credentials> {
        if let Some(token) = self.graph_token {
            return Some(Credentials::Token(token));
        }
        match (self.directory_tenant, self.client_id, self.client_secret) {
            (Some(directory_tenant), Some(client_id), Some(client_secret)) => {
                Some(Credentials::ClientSecret {
                    directory_tenant,
                    client_id,
                    client_secret,
                })
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SelectMode {
    /// Use a profile only when exactly one exists
    Auto,
    /// Ask on the terminal
    Prompt,
    /// Fail when more than one profile exists
    Reject,
}

#[derive(Subcommand)]
enum TenantAction {
    /// Add a tenant
    Add {
        #[arg(short, long)]
        name: String,
        /// Administrator account for the tenant
        #[arg(long)]
        admin: String,
        /// Default image for the tenant's VMs
        #[arg(long)]
        image: String,
    },
}

#[derive(Subcommand)]
enum ImageAction {
    /// Add an image
    Add {
        #[arg(short, long)]
        name: String,
        /// Install media (ISO) the reference image is built from
        #[arg(long)]
        media: PathBuf,
        /// Where the reference disk lives or will be built
        #[arg(long)]
        reference: PathBuf,
    },
}

// Table display structs
#[derive(Tabled)]
struct TenantRow {
    #[tabled(rename = "Tenant")]
    name: String,
    #[tabled(rename = "Admin")]
    admin: String,
    #[tabled(rename = "Image")]
    image: String,
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "Image")]
    name: String,
    #[tabled(rename = "Media")]
    media: String,
    #[tabled(rename = "Reference")]
    reference: String,
    #[tabled(rename = "Built")]
    built: String,
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Serial")]
    serial: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!(error = %e, "hv-fleet failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hv_fleet={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether every requested VM succeeded
fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Provision(args) => provision(&cli.config, args),
        Commands::Init { vm_path, switch, vlan } => {
            if cli.config.exists() {
                return Err(hv_fleet::Error::Configuration(format!(
                    "{} already exists",
                    cli.config.display()
                )));
            }
            let mut catalog = FleetCatalog::new(vm_path, switch);
            catalog.vlan_id = vlan;
            catalog.save(&cli.config)?;
            println!("Catalog written: {}", cli.config.display());
            Ok(true)
        }
        Commands::Tenant {
            action: TenantAction::Add { name, admin, image },
        } => {
            let mut catalog = FleetCatalog::load(&cli.config)?;
            catalog.image(&image)?;
            catalog.add_tenant(TenantConfig {
                tenant_name: name.clone(),
                admin_identity: admin,
                image_name: image,
            })?;
            catalog.save(&cli.config)?;
            println!("Tenant added: {}", name);
            Ok(true)
        }
        Commands::Image {
            action: ImageAction::Add { name, media, reference },
        } => {
            let mut catalog = FleetCatalog::load(&cli.config)?;
            catalog.add_image(ImageCatalogEntry {
                image_name: name.clone(),
                install_media_path: media,
                reference_image_path: reference,
            })?;
            catalog.save(&cli.config)?;
            println!("Image added: {}", name);
            Ok(true)
        }
        Commands::Show => {
            show(&FleetCatalog::load(&cli.config)?);
            Ok(true)
        }
    }
}

fn provision(config: &Path, args: ProvisionArgs) -> Result<bool> {
    let catalog = FleetCatalog::load(config)?;

    let request = VmRequest::builder(&args.tenant)
        .count(args.count)
        .cpu_count(args.cpus)
        .memory_gb(args.memory_gb)
        .skip_enrollment(args.skip_enrollment)
        .dry_run(args.dry_run)
        .failure_policy(if args.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::Isolate
        });
    let request = match args.os_build {
        Some(image) => request.image(image),
        None => request,
    }
    .build_validated()?;

    let directory: Box<dyn DirectoryApi> = match args.credentials.into_credentials() {
        Some(credentials) => Box::new(GraphClient::new(credentials)?),
        None => Box::new(UnconfiguredDirectory),
    };
    let selector: Box<dyn ProfileSelector> = match args.select {
        SelectMode::Auto => Box::new(AutoSelect),
        SelectMode::Prompt => Box::new(OperatorPrompt),
        SelectMode::Reject => Box::new(RejectAmbiguous),
    };

    let hyperv = Arc::new(HyperV::new(catalog.timeouts)?);
    let images = ReferenceImageBuilder::new(Box::new(ScriptImageBuilder::new(
        catalog.image_builder_script.clone(),
        catalog.timeouts.image_build(),
    )?));
    let policy = PolicyFetcher::new(directory, selector);
    let orchestrator = FleetOrchestrator::new(catalog, hyperv, images, policy);

    let report = orchestrator.run(&request)?;
    print_report(&report);
    Ok(report.is_success())
}

fn print_report(report: &FleetReport) {
    println!("Tenant:     {}", report.tenant);
    println!("Image:      {} ({})", report.image, report.image_status);
    println!("Workspace:  {}", report.workspace.display());
    println!("Enrollment: {}", report.enrollment);
    println!("Run:        {}", report.run_id);
    println!();

    if report.results.is_empty() {
        println!("No VMs requested.");
        return;
    }

    let rows: Vec<VmRow> = report
        .results
        .iter()
        .map(|(name, outcome)| {
            let (result, serial, detail) = match outcome {
                VmOutcome::Provisioned(record) => (
                    "Provisioned",
                    record.hardware_serial.clone(),
                    record.state.to_string(),
                ),
                VmOutcome::Failed(e) => ("Failed", "-".to_string(), e.to_string()),
                VmOutcome::Skipped => ("Skipped", "-".to_string(), "not attempted".to_string()),
                VmOutcome::Planned => ("Planned", "-".to_string(), "dry run".to_string()),
            };
            VmRow {
                name: name.clone(),
                result: result.to_string(),
                serial,
                detail,
            }
        })
        .collect();
    println!("{}", Table::new(rows));

    if report.dry_run {
        println!("\nDry run: nothing was changed.");
    } else if !report.is_success() {
        println!("\n{} of {} VMs did not provision.", report.failed_count(), report.results.len());
    }
}

fn show(catalog: &FleetCatalog) {
    println!("VM path: {}", catalog.vm_path.display());
    println!("Switch:  {}", catalog.switch_name);
    if let Some(vlan) = catalog.vlan_id {
        println!("VLAN:    {}", vlan);
    }
    println!();

    if catalog.tenant_config.is_empty() {
        println!("No tenants configured.");
    } else {
        let rows: Vec<TenantRow> = catalog
            .tenant_config
            .iter()
            .map(|t| TenantRow {
                name: t.tenant_name.clone(),
                admin: t.admin_identity.clone(),
                image: t.image_name.clone(),
            })
            .collect();
        println!("{}", Table::new(rows));
    }
    println!();

    if catalog.images.is_empty() {
        println!("No images configured.");
    } else {
        let rows: Vec<ImageRow> = catalog
            .images
            .iter()
            .map(|i| ImageRow {
                name: i.image_name.clone(),
                media: i.install_media_path.display().to_string(),
                reference: i.reference_image_path.display().to_string(),
                built: if i.reference_image_path.exists() { "Yes" } else { "No" }.to_string(),
            })
            .collect();
        println!("{}", Table::new(rows));
    }
}
