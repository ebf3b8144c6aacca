use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::{StreamExt, future::join_all};
use tokio::signal;
use tracing::{debug, error, info, warn};

use model_transfer::{
    OrchestratorConfig, TransferOrchestrator,
    common::{client::client::BackendClient, logger::PrettyLogger},
    downloader::{
        batch::{BatchCoordinator, BatchJob, ConcurrencyPolicy},
        cancel::CancelAck,
        models::{FormFields, SessionState, TransferSpec},
        progress::TransferProgress,
    },
    log_error, log_info, log_step, log_success, log_warning,
    resolver::{self, ModelResolver},
};

mod cli;

use cli::{Cli, Command};

/// 加载配置，命令行参数优先
fn load_config(args: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("无法加载配置 {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    }
    Ok(config)
}

fn batch_policy(config: &OrchestratorConfig, concurrency: Option<usize>) -> ConcurrencyPolicy {
    let mut policy = ConcurrencyPolicy::from_config(config);
    if let Some(n) = concurrency {
        policy.max_in_flight = n.max(1);
    }
    policy
}

/// 单个传输；需要凭据且命令行给了凭据时，用新会话重试一次
async fn download(
    orchestrator: &TransferOrchestrator,
    spec: TransferSpec,
    credentials: FormFields,
) -> Result<()> {
    let label = spec.display_label();
    log_step!("开始传输: {}", label);

    let mut handle = orchestrator.start(&spec).await.map_err(|e| {
        log_error!("启动失败: {}", e);
        e
    })?;
    info!("会话 ID: {}", handle.session_id);
    let mut record = handle.wait().await;

    if record.state == SessionState::AccessRestricted && !credentials.is_empty() {
        log_info!("使用提供的凭据重试 {}", label);
        let mut retry = orchestrator
            .retry_with_credentials(&spec, handle.retry_count, &credentials)
            .await?;
        info!("重试会话 ID: {} (第 {} 次)", retry.session_id, retry.retry_count);
        record = retry.wait().await;
    }

    PrettyLogger::status(&label, &record);
    match record.state {
        SessionState::Completed => {
            log_success!("{} 已保存到 {}", label, spec.path);
            Ok(())
        }
        SessionState::AccessRestricted => {
            log_warning!("{} 需要访问凭据，请使用 --token 或 --api-key 重试", label);
            bail!("需要访问凭据")
        }
        SessionState::Cancelled => {
            log_warning!("{} 已取消", label);
            Ok(())
        }
        _ => bail!("传输失败: {}", record.message),
    }
}

async fn run_batch(
    orchestrator: &Arc<TransferOrchestrator>,
    specs: Vec<TransferSpec>,
    policy: ConcurrencyPolicy,
) -> BatchJob {
    let coordinator = BatchCoordinator::new(Arc::clone(orchestrator));
    let mut run = coordinator.run(specs, policy);
    info!("批量任务 ID: {}", run.id());

    while let Some(outcome) = run.next().await {
        PrettyLogger::item_outcome(&outcome);
    }
    let job = run.job();
    PrettyLogger::batch_summary(&job);
    job
}

/// 批量传输；有需要凭据的项且命令行给了凭据时，对失败项再跑一轮
async fn sync(
    orchestrator: &Arc<TransferOrchestrator>,
    specs: Vec<TransferSpec>,
    policy: ConcurrencyPolicy,
    credentials: FormFields,
) -> Result<()> {
    if specs.is_empty() {
        log_info!("没有需要传输的条目");
        return Ok(());
    }

    log_step!("批量传输 {} 项", specs.len());
    let mut job = run_batch(orchestrator, specs, policy).await;

    if job.restricted_count() > 0 && !credentials.is_empty() {
        let retry = BatchCoordinator::retry_failed(&job, &credentials);
        log_step!("使用提供的凭据重试 {} 项", retry.len());
        job = run_batch(orchestrator, retry, policy).await;
    }

    if job.failed_count() > 0 || job.restricted_count() > 0 {
        bail!(
            "{} 项失败，{} 项需要凭据",
            job.failed_count(),
            job.restricted_count()
        );
    }
    Ok(())
}

async fn read_items(path: &Path) -> Result<Vec<TransferSpec>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取 {}", path.display()))?;
    let specs: Vec<TransferSpec> =
        serde_json::from_str(&text).with_context(|| format!("{} 格式不正确", path.display()))?;
    debug!("读取到 {} 个条目", specs.len());
    Ok(specs)
}

async fn resolve(
    orchestrator: &Arc<TransferOrchestrator>,
    workflow: &Path,
    installed: &Path,
    dry_run: bool,
    policy: ConcurrencyPolicy,
    credentials: FormFields,
) -> Result<()> {
    let workflow = ModelResolver::load_workflow(workflow).await?;
    let resolver = ModelResolver::from_listing(installed).await?;
    let missing = resolver.find_missing(&workflow)?;

    if missing.is_empty() {
        log_success!("工作流需要的模型都已安装");
        return Ok(());
    }

    PrettyLogger::separator();
    for model in &missing.missing {
        log_info!("缺少 {} -> {}", model.name, model.destination());
    }
    for model in &missing.unresolved {
        log_warning!("缺少 {}，没有下载地址，需要手动安装", model.name);
    }

    if dry_run {
        return Ok(());
    }

    let specs = resolver::to_transfer_specs(&missing);
    sync(orchestrator, specs, policy, credentials).await
}

async fn run(args: &Cli, orchestrator: Arc<TransferOrchestrator>) -> Result<()> {
    match &args.command {
        Command::Download {
            provider,
            path,
            fields,
            label,
            credentials,
        } => {
            let mut spec = TransferSpec::new(*provider, path.clone());
            for (key, value) in fields {
                spec = spec.field(key, value.clone());
            }
            if let Some(label) = label {
                spec = spec.with_label(label.clone());
            }
            download(&orchestrator, spec, credentials.to_fields()).await
        }
        Command::Sync {
            items,
            concurrency,
            credentials,
        } => {
            let specs = read_items(items).await?;
            let policy = batch_policy(orchestrator.config(), *concurrency);
            sync(&orchestrator, specs, policy, credentials.to_fields()).await
        }
        Command::Resolve {
            workflow,
            installed,
            dry_run,
            concurrency,
            credentials,
        } => {
            let policy = batch_policy(orchestrator.config(), *concurrency);
            resolve(
                &orchestrator,
                workflow,
                installed,
                *dry_run,
                policy,
                credentials.to_fields(),
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Cli::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = load_config(&args)?;
    info!("后端地址: {}", config.base_url);

    let client = BackendClient::new(&config.base_url, config.request_timeout()).map_err(|e| {
        error!("创建客户端失败: {}", e);
        e
    })?;
    let orchestrator = Arc::new(TransferOrchestrator::new(config, Arc::new(client)));

    let renderer = tokio::spawn(
        TransferProgress::new(Arc::clone(orchestrator.registry())).run(orchestrator.subscribe()),
    );

    let result = tokio::select! {
        result = run(&args, Arc::clone(&orchestrator)) => result,
        _ = signal::ctrl_c() => {
            warn!("收到中断信号，取消所有传输");
            let acks = join_all(orchestrator.cancel_all()).await;
            let unconfirmed = acks
                .iter()
                .filter(|ack| !matches!(ack, CancelAck::Acknowledged | CancelAck::NotActive))
                .count();
            if unconfirmed > 0 {
                log_warning!("{} 个会话未收到后端的取消确认", unconfirmed);
            }
            log_info!("已取消 {} 个会话", acks.len());
            Ok(())
        }
    };

    renderer.abort();
    result
}
