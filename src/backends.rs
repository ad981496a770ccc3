//! Backend descriptors: the concrete `BackendDescriptor` values registered
//! into [`crate::registry::BackendRegistry`] at startup.
//!
//! Each process-backed descriptor (llama.cpp, vLLM, MLX, diffusers) spawns
//! its binary with `--host <unix-socket-path>` plus the flags the bundle and
//! mode call for, and blocks in `run` until the process exits or `cancel`
//! fires — mirroring the `tokio::process::Command` + `kill_on_drop` pattern
//! used by llama-server's own Rust wrapper. The `openai-proxy` descriptor is
//! a passthrough: it owns no process, so `run` just waits on `cancel`.

use std::process::Stdio;

use futures_util::FutureExt;
use tokio::process::Command;

use crate::{
    config::BackendRuntimeConfig,
    error::{SchedulerError, startup_failed},
    registry::{BackendDescriptor, InstallContext, RunContext},
    types::{BackendMode, BundleFormat},
};

fn install_noop(_ctx: InstallContext) -> futures_util::future::BoxFuture<'static, Result<(), SchedulerError>> {
    async { Ok(()) }.boxed()
}

/// Builds argv for a llama.cpp-shaped backend: weight path, projector (if
/// any), context size, mode flags, and the operator's `extra_args`, in that
/// order. `--host`/`--model`/`--embeddings`/`--mmproj` are never taken from
/// `extra_args` (rejected at config-load time, see [`crate::config`]); they
/// are always set here, by the core.
fn llama_cpp_argv(ctx: &RunContext, socket_path: &std::path::Path) -> Result<Vec<String>, SchedulerError> {
    let bundle = ctx
        .bundle
        .as_ref()
        .ok_or_else(|| startup_failed("llama.cpp runner has no bundle"))?;

    let mut argv = vec![
        "--host".to_string(),
        socket_path.display().to_string(),
        "--model".to_string(),
        bundle.weight_path.display().to_string(),
        "--ctx-size".to_string(),
        bundle.context_size.max(ctx.config.context_size).to_string(),
    ];

    if let Some(projector) = &bundle.projector_path {
        argv.push("--mmproj".to_string());
        argv.push(projector.display().to_string());
    }

    if ctx.mode == BackendMode::Embedding {
        argv.push("--embeddings".to_string());
    }

    argv.extend(ctx.config.mode_flags.iter().cloned());
    argv.extend(ctx.config.runtime_flags.iter().cloned());
    Ok(argv)
}

fn spawn_on_socket(
    binary: &std::path::Path,
    argv: Vec<String>,
    cancel: tokio_util::sync::CancellationToken,
) -> futures_util::future::BoxFuture<'static, Result<(), SchedulerError>> {
    let binary = binary.to_path_buf();
    async move {
        let mut child = Command::new(&binary)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| startup_failed(format!("failed to spawn {}: {err}", binary.display())))?;

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(startup_failed(format!("{} exited with {status}", binary.display()))),
                    Err(err) => Err(startup_failed(format!("failed to wait on {}: {err}", binary.display()))),
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Ok(())
            }
        }
    }
    .boxed()
}

fn process_backed(
    name: &'static str,
    binary_path: std::path::PathBuf,
    supported_modes: &'static [BackendMode],
    supported_formats: &'static [BundleFormat],
    deferred: bool,
    argv_builder: fn(&RunContext, &std::path::Path) -> Result<Vec<String>, SchedulerError>,
) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_string(),
        deferred,
        is_passthrough: false,
        supported_modes,
        supported_formats,
        install: std::sync::Arc::new(install_noop),
        run: std::sync::Arc::new(move |ctx: RunContext| {
            let binary_path = binary_path.clone();
            async move {
                let socket_path = ctx
                    .socket_path
                    .clone()
                    .ok_or_else(|| startup_failed(format!("{name} runner has no socket path")))?;
                let argv = argv_builder(&ctx, &socket_path)?;
                spawn_on_socket(&binary_path, argv, ctx.cancel.clone()).await
            }
            .boxed()
        }),
    }
}

const LLAMA_CPP_MODES: &[BackendMode] =
    &[BackendMode::Completion, BackendMode::Embedding, BackendMode::Rerank, BackendMode::Score];
const LLAMA_CPP_FORMATS: &[BundleFormat] = &[BundleFormat::Gguf];

const VLLM_MODES: &[BackendMode] = &[BackendMode::Completion, BackendMode::Embedding];
const VLLM_MLX_FORMATS: &[BundleFormat] = &[BundleFormat::SafeTensors];

const DIFFUSERS_MODES: &[BackendMode] = &[BackendMode::Image];
const DIFFUSERS_FORMATS: &[BundleFormat] = &[BundleFormat::Diffusers];

/// llama.cpp's `llama-server`, launched against a GGUF bundle. Supports
/// completion, embedding, rerank and score by varying its launch flags
/// rather than by running multiple binaries (spec.md §3 "BackendMode").
pub fn llama_cpp(runtime: &BackendRuntimeConfig) -> BackendDescriptor {
    let binary = runtime
        .binary_path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("llama-server"));
    process_backed(
        "llama.cpp",
        binary,
        LLAMA_CPP_MODES,
        LLAMA_CPP_FORMATS,
        runtime.deferred,
        llama_cpp_argv,
    )
}

fn generic_argv(ctx: &RunContext, socket_path: &std::path::Path) -> Result<Vec<String>, SchedulerError> {
    let bundle = ctx
        .bundle
        .as_ref()
        .ok_or_else(|| startup_failed("runner has no bundle"))?;
    let mut argv = vec![
        "--host".to_string(),
        socket_path.display().to_string(),
        "--model".to_string(),
        bundle.weight_path.display().to_string(),
    ];
    argv.extend(ctx.config.mode_flags.iter().cloned());
    argv.extend(ctx.config.runtime_flags.iter().cloned());
    Ok(argv)
}

/// vLLM, launched against a safetensors bundle. Preferred over MLX on
/// non-Apple targets by [`crate::registry::BackendRegistry::default_for`].
pub fn vllm(runtime: &BackendRuntimeConfig) -> BackendDescriptor {
    let binary = runtime
        .binary_path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("vllm"));
    process_backed("vllm", binary, VLLM_MODES, VLLM_MLX_FORMATS, runtime.deferred, generic_argv)
}

/// Apple-silicon MLX runtime, preferred over vLLM under `cfg(target_os =
/// "macos")`.
pub fn mlx(runtime: &BackendRuntimeConfig) -> BackendDescriptor {
    let binary = runtime
        .binary_path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("mlx_lm.server"));
    process_backed("mlx", binary, VLLM_MODES, VLLM_MLX_FORMATS, runtime.deferred, generic_argv)
}

/// Diffusers image-generation backend.
pub fn diffusers(runtime: &BackendRuntimeConfig) -> BackendDescriptor {
    let binary = runtime
        .binary_path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("diffusers-server"));
    process_backed(
        "diffusers",
        binary,
        DIFFUSERS_MODES,
        DIFFUSERS_FORMATS,
        runtime.deferred,
        generic_argv,
    )
}

/// A passthrough backend that proxies to a remote OpenAI-compatible API
/// instead of running a local process — it occupies a Runner slot but owns
/// no subprocess (spec.md §9 glossary "Passthrough backend").
pub fn openai_proxy() -> BackendDescriptor {
    BackendDescriptor {
        name: "openai-proxy".to_string(),
        deferred: false,
        is_passthrough: true,
        supported_modes: &[BackendMode::Completion, BackendMode::Embedding, BackendMode::Image],
        supported_formats: &[],
        install: std::sync::Arc::new(install_noop),
        run: std::sync::Arc::new(|ctx: RunContext| {
            async move {
                ctx.cancel.cancelled().await;
                Ok(())
            }
            .boxed()
        }),
    }
}
