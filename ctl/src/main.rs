// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! `arborctl`: submit applications to the local daemon, inspect the node
//! hierarchy and hosted jobs, terminate applications. Prints one line per
//! response record and exits with the mapped kernel exit code.

use clap::{Parser, Subcommand};
use daemon::service::{
    JOB_STATUS_TYPE, JobStatusKernel, STATUS_TYPE, StatusKernel, SUBMIT_TYPE, SubmitKernel,
    TERMINATE_TYPE, TerminateKernel, register_client_kernels,
};
use kernel::{
    Application, Kernel, KernelBuffer, KernelError, KernelHeader, KernelPtr, ProtoFlags,
    TypeRegistry,
};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
enum CtlError {
    #[error("cannot reach the daemon at {path}: {source}")]
    Connect { path: PathBuf, source: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

#[derive(Parser)]
#[command(name = "arborctl")]
#[command(about = "Control the local arbor daemon", long_about = None)]
struct Args {
    /// Unix socket of the daemon.
    #[arg(long, value_name = "PATH", default_value = remote::unix::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch an application on the cluster.
    Submit {
        executable: PathBuf,
        #[arg(trailing_var_arg = true)]
        arguments: Vec<String>,
    },
    /// Show the node hierarchy per interface.
    Status,
    /// Show hosted applications.
    Jobs,
    /// Terminate a hosted application.
    Terminate { application: u64 },
}

fn write_request(k: &dyn Kernel, type_id: u16) -> Result<Vec<u8>, KernelError> {
    let mut out = KernelBuffer::new();
    {
        let mut frame = out.begin_frame();
        k.base().header().write(
            &mut frame,
            ProtoFlags::PREPEND_APPLICATION | ProtoFlags::PREPEND_SOURCE_AND_DESTINATION,
        );
        frame.write_u16(type_id);
        k.write(&mut frame)?;
    }
    Ok(out.as_slice().to_vec())
}

/// Send one service kernel, await the response kernel on the same stream.
fn request(path: &Path, k: &dyn Kernel, type_id: u16) -> Result<KernelPtr, CtlError> {
    let mut types = TypeRegistry::new();
    register_client_kernels(&mut types)?;

    let mut stream = UnixStream::connect(path)
        .map_err(|source| CtlError::Connect { path: path.to_path_buf(), source })?;
    stream.write_all(&write_request(k, type_id)?)?;

    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix)?;
    let length = u32::from_le_bytes(prefix) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body)?;

    let mut frame = KernelBuffer::from_vec(body);
    let header = KernelHeader::read(&mut frame)?;
    let response_type = frame.read_u16()?;
    let mut response = types.construct(response_type)?;
    response.read(&mut frame)?;
    response.base_mut().set_header(header);
    Ok(response)
}

fn print_records(records: &[String]) {
    for record in records {
        println!("{record}");
    }
}

fn run(args: &Args) -> Result<i32, CtlError> {
    let response = match &args.command {
        Command::Submit { executable, arguments } => {
            let mut argv = vec![executable.to_string_lossy().into_owned()];
            argv.extend(arguments.iter().cloned());
            let mut app = Application::new(argv);
            app.set_credentials(
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            );
            if let Ok(cwd) = std::env::current_dir() {
                app.set_working_directory(cwd);
            }
            let request_kernel = SubmitKernel::new(app);
            request(&args.socket, &request_kernel, SUBMIT_TYPE)?
        }
        Command::Status => request(&args.socket, &StatusKernel::new(), STATUS_TYPE)?,
        Command::Jobs => request(&args.socket, &JobStatusKernel::new(), JOB_STATUS_TYPE)?,
        Command::Terminate { application } => {
            request(&args.socket, &TerminateKernel::new(*application), TERMINATE_TYPE)?
        }
    };

    if let Some(k) = response.as_any().downcast_ref::<SubmitKernel>() {
        print_records(k.records());
    } else if let Some(k) = response.as_any().downcast_ref::<StatusKernel>() {
        print_records(k.records());
    } else if let Some(k) = response.as_any().downcast_ref::<JobStatusKernel>() {
        print_records(k.records());
    } else if let Some(k) = response.as_any().downcast_ref::<TerminateKernel>() {
        print_records(k.records());
    }
    Ok(response.base().result().process_exit_code())
}

fn main() {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("arborctl: {e}");
            std::process::exit(2);
        }
    }
}
