use color_eyre::Report;
use eyre::{eyre, WrapErr};
use ipgate::cache::FileCache;
use ipgate::ip::{EchoService, IpSource};
use ipgate::providers::aws::{AwsGroups, Region, RegionGroups};
use ipgate::stack::StackSummary;
use ipgate::{AccessReport, Mode, Protocol, Reconciler, Target};
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

/// Keep an EC2 security group's ingress pointed at your current public IP.
#[derive(Debug, StructOpt)]
#[structopt(name = "ipgate")]
struct Opt {
    /// More logging (-v for debug, -vv for trace). RUST_LOG takes precedence.
    #[structopt(short, long, parse(from_occurrences), global = true)]
    verbose: u8,

    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Make the security group admit the current public IP.
    Sync {
        #[structopt(flatten)]
        target: TargetOpt,

        /// `strict` revokes every other source on the port, `additive` only adds.
        #[structopt(long, default_value = "strict", possible_values = &["strict", "additive"])]
        mode: Mode,

        /// Where to remember the last synced IP.
        #[structopt(long, env = "IPGATE_CACHE", parse(from_os_str))]
        cache: Option<PathBuf>,

        /// Check the security group even if the IP has not changed.
        #[structopt(long)]
        force: bool,
    },
    /// Report whether the current public IP may reach the security group.
    ///
    /// Without --sg-id or --stack, every Pulumi stack that exports a security group is checked.
    Check {
        #[structopt(flatten)]
        target: TargetOpt,

        /// Only check stacks of projects whose name starts with this.
        #[structopt(long)]
        project: Option<String>,

        /// Print the report as JSON.
        #[structopt(long)]
        json: bool,
    },
    /// List Pulumi stacks and their key outputs.
    List {
        /// Only list stacks of projects whose name starts with this.
        #[structopt(long)]
        project: Option<String>,

        /// Print the stacks as JSON.
        #[structopt(long)]
        json: bool,
    },
}

#[derive(Debug, StructOpt)]
struct TargetOpt {
    /// Security group to manage.
    #[structopt(long = "sg-id", env = "IPGATE_SG_ID")]
    sg_id: Option<String>,

    /// Read the security group id from this Pulumi stack's outputs. Takes precedence over
    /// --sg-id.
    #[structopt(long)]
    stack: Option<String>,

    #[structopt(long, default_value = "22")]
    port: u16,

    #[structopt(long, default_value = "tcp")]
    protocol: Protocol,

    /// AWS region (defaults to AWS_DEFAULT_REGION / AWS_REGION).
    #[structopt(long)]
    region: Option<Region>,

    /// Named profile from the shared AWS credentials file.
    #[structopt(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// Seconds to wait for each network call.
    #[structopt(long, default_value = "10")]
    timeout: u64,

    /// IP echo service to ask for the public IP. May be repeated; tried in order.
    #[structopt(long = "echo-url")]
    echo_urls: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Group<'a> {
    Stack(&'a str),
    Id(&'a str),
}

impl TargetOpt {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn target_for(&self, group_id: String) -> Result<Target, Report> {
        let target = Target::ssh(group_id)
            .port(self.port)
            .protocol(self.protocol);
        target.validate()?;
        Ok(target)
    }

    /// Where the group id comes from. `--stack` wins so that `IPGATE_SG_ID` in the environment
    /// cannot shadow it.
    fn group(&self) -> Option<Group<'_>> {
        match (&self.stack, &self.sg_id) {
            (Some(stack), _) => Some(Group::Stack(stack)),
            (None, Some(id)) => Some(Group::Id(id)),
            (None, None) => None,
        }
    }

    async fn target(&self) -> Result<Target, Report> {
        let group_id = match self.group() {
            Some(Group::Stack(stack)) => ipgate::stack::resolve_security_group(stack).await?,
            Some(Group::Id(id)) => id.to_string(),
            None => eyre::bail!("either --sg-id or --stack must be given"),
        };
        self.target_for(group_id)
    }

    fn connect(&self) -> Result<RegionGroups, Report> {
        let aws = match self.region {
            Some(ref r) => AwsGroups::default().region(r.clone()),
            None => AwsGroups::default(),
        };
        let ec2 = match self.profile {
            Some(ref p) => aws.with_profile(p).connect(),
            None => aws.connect(),
        };
        ec2.wrap_err("failed to connect to ec2")
    }

    fn echo(&self) -> EchoService {
        let echo = EchoService::default().timeout(self.timeout());
        if self.echo_urls.is_empty() {
            echo
        } else {
            echo.endpoints(&self.echo_urls)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "ipgate=info",
        1 => "ipgate=debug",
        _ => "ipgate=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn sync(
    t: TargetOpt,
    mode: Mode,
    cache: Option<PathBuf>,
    force: bool,
) -> Result<(), Report> {
    let target = t.target().await?;
    let cache = match cache {
        Some(p) => p,
        None => FileCache::default_path(&target.group_id, target.protocol, target.port)
            .ok_or_else(|| eyre!("could not find a cache directory, pass --cache"))?,
    };
    tracing::debug!(cache = %cache.display(), %target, "syncing");

    let mut r = Reconciler::new(t.connect()?, t.echo(), FileCache::new(cache))
        .mode(mode)
        .timeout(t.timeout())
        .force(force);
    let outcome = r
        .run(&target)
        .await
        .wrap_err_with(|| format!("failed to sync {}", target))?;
    println!("{}: {}", target, outcome);
    Ok(())
}

fn print_reports(reports: &[AccessReport]) {
    match reports.first() {
        Some(r) => println!("current ip: {}", r.current_cidr),
        None => {
            println!("no stacks export a security group");
            return;
        }
    }
    for r in reports {
        let status = if r.has_access { "ALLOWED" } else { "DENIED" };
        match r.stack {
            Some(ref stack) => println!(
                "{} ({} {}/{}): {}",
                stack, r.security_group_id, r.protocol, r.port, status
            ),
            None => println!(
                "{} {}/{}: {}",
                r.security_group_id, r.protocol, r.port, status
            ),
        }
        if r.authorized_cidrs.is_empty() {
            println!("  no sources authorized");
        }
        for cidr in &r.authorized_cidrs {
            if *cidr == r.current_cidr {
                println!("  - {} (current)", cidr);
            } else {
                println!("  - {}", cidr);
            }
        }
    }
}

async fn check(t: TargetOpt, project: Option<String>, json: bool) -> Result<(), Report> {
    let ip = t.echo().resolve().await?;

    if t.group().is_some() {
        let target = t.target().await?;
        let ec2 = t.connect()?;
        let mut report = ipgate::check_access(&ec2, &target, ip, t.timeout())
            .await
            .wrap_err_with(|| format!("failed to check {}", target))?;
        report.stack = t.stack.clone();

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_reports(&[report]);
        }
        return Ok(());
    }

    let stacks = ipgate::stack::stacks_with_security_groups(project.as_deref()).await?;
    let mut reports = Vec::with_capacity(stacks.len());
    if !stacks.is_empty() {
        let ec2 = t.connect()?;
        for (stack, group_id) in stacks {
            let target = t.target_for(group_id)?;
            let mut report = ipgate::check_access(&ec2, &target, ip, t.timeout())
                .await
                .wrap_err_with(|| format!("failed to check stack {}", stack.name))?;
            report.stack = Some(stack.name);
            reports.push(report);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_reports(&reports);
    }
    Ok(())
}

fn print_stacks(stacks: &[StackSummary]) {
    if stacks.is_empty() {
        println!("no stacks found");
        return;
    }
    for s in stacks {
        println!("{} ({})", s.name, s.project);
        if let Some(ref t) = s.last_update {
            println!("  last updated: {}", t);
        }
        if let Some(n) = s.resources {
            println!("  resources: {}", n);
        }
        let outputs = s.outputs.as_ref().and_then(|o| o.as_object());
        for (key, label) in &[
            ("public_ip", "public ip"),
            ("vpc_id", "vpc"),
            ("security_group_id", "security group"),
        ] {
            if let Some(v) = outputs.and_then(|o| o.get(*key)).and_then(|v| v.as_str()) {
                println!("  {}: {}", label, v);
            }
        }
    }
}

async fn list(project: Option<String>, json: bool) -> Result<(), Report> {
    let mut stacks = ipgate::stack::list_stacks(project.as_deref()).await?;
    for s in &mut stacks {
        match s.fetch_outputs().await {
            Ok(o) => s.outputs = Some(o),
            Err(e) => tracing::warn!(stack = %s.name, "could not read outputs: {}", e),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&stacks)?);
    } else {
        print_stacks(&stacks);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let opt = Opt::from_args();
    init_tracing(opt.verbose);

    match opt.cmd {
        Cmd::Sync {
            target,
            mode,
            cache,
            force,
        } => sync(target, mode, cache, force).await,
        Cmd::Check {
            target,
            project,
            json,
        } => check(target, project, json).await,
        Cmd::List { project, json } => list(project, json).await,
    }
}
