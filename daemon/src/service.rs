// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Control service kernels: submit, status, job status and terminate.
//! Each CLI command sends exactly one of these over the unix socket; the
//! daemon answers with the same kernel flowing downstream.

use discovery::{DiscoveryState, HIERARCHY_TYPE, HierarchyKernel, PROBE_TYPE, Probe};
use factory::Factory;
use kernel::{
    Application, Context, ExitCode, Kernel, KernelBase, KernelBuffer, KernelError, Step,
    TypeRegistry, kernel_base,
};
use remote::ProcessPipeline;
use std::sync::{Arc, OnceLock};
use tracing::error;

/// Portable type ids of the control kernels.
pub const STATUS_TYPE: u16 = 10;
pub const JOB_STATUS_TYPE: u16 = 11;
pub const SUBMIT_TYPE: u16 = 12;
pub const TERMINATE_TYPE: u16 = 13;

/// Daemon state the service kernels operate on; attached once the factory
/// is composed.
pub struct ServiceContext {
    discovery: Arc<DiscoveryState>,
    process: OnceLock<Arc<ProcessPipeline>>,
}

impl ServiceContext {
    pub fn new(discovery: Arc<DiscoveryState>) -> Self {
        Self { discovery, process: OnceLock::new() }
    }

    pub fn attach(&self, factory: &Factory) {
        if let Some(process) = factory.process() {
            let _ = self.process.set(Arc::clone(process));
        }
    }

    fn submit(&self, app: Application) -> Result<u64, String> {
        let Some(process) = self.process.get() else {
            return Err("process pipeline is disabled".to_string());
        };
        process.add(app).map_err(|e| e.to_string())
    }

    fn terminate(&self, application: u64) -> Result<(), String> {
        let Some(process) = self.process.get() else {
            return Err("process pipeline is disabled".to_string());
        };
        process.terminate(application);
        Ok(())
    }

    fn hierarchy_records(&self) -> Vec<String> {
        self.discovery.snapshot()
    }

    fn job_records(&self) -> Vec<String> {
        match self.process.get() {
            Some(process) => process
                .applications()
                .into_iter()
                .map(|id| format!("application={id},state=running"))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Register the discovery kernels with their shared state.
pub fn register_discovery_kernels(
    types: &mut TypeRegistry,
    state: &Arc<DiscoveryState>,
) -> Result<(), KernelError> {
    let probe_state = Arc::clone(state);
    types.register_ctor::<Probe>(PROBE_TYPE, move || {
        Box::new(Probe::with_state(Arc::clone(&probe_state)))
    })?;
    let hierarchy_state = Arc::clone(state);
    types.register_ctor::<HierarchyKernel>(HIERARCHY_TYPE, move || {
        Box::new(HierarchyKernel::with_state(Arc::clone(&hierarchy_state)))
    })?;
    Ok(())
}

/// Register the control kernels with the daemon-side service context.
pub fn register_service_kernels(
    types: &mut TypeRegistry,
    services: &Arc<ServiceContext>,
) -> Result<(), KernelError> {
    let ctx = Arc::clone(services);
    types.register_ctor::<SubmitKernel>(SUBMIT_TYPE, move || {
        Box::new(SubmitKernel { services: Some(Arc::clone(&ctx)), ..Default::default() })
    })?;
    let ctx = Arc::clone(services);
    types.register_ctor::<StatusKernel>(STATUS_TYPE, move || {
        Box::new(StatusKernel { services: Some(Arc::clone(&ctx)), ..Default::default() })
    })?;
    let ctx = Arc::clone(services);
    types.register_ctor::<JobStatusKernel>(JOB_STATUS_TYPE, move || {
        Box::new(JobStatusKernel { services: Some(Arc::clone(&ctx)), ..Default::default() })
    })?;
    let ctx = Arc::clone(services);
    types.register_ctor::<TerminateKernel>(TERMINATE_TYPE, move || {
        Box::new(TerminateKernel { services: Some(Arc::clone(&ctx)), ..Default::default() })
    })?;
    Ok(())
}

/// Register stateless constructors; the CLI uses these to parse responses.
pub fn register_client_kernels(types: &mut TypeRegistry) -> Result<(), KernelError> {
    types.register::<SubmitKernel>(SUBMIT_TYPE)?;
    types.register::<StatusKernel>(STATUS_TYPE)?;
    types.register::<JobStatusKernel>(JOB_STATUS_TYPE)?;
    types.register::<TerminateKernel>(TERMINATE_TYPE)?;
    Ok(())
}

fn write_records(out: &mut KernelBuffer, records: &[String]) {
    out.write_u32(records.len() as u32);
    for record in records {
        out.write_str(record);
    }
}

fn read_records(buf: &mut KernelBuffer) -> Result<Vec<String>, KernelError> {
    let count = buf.read_u32()? as usize;
    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        records.push(buf.read_string()?);
    }
    Ok(records)
}

/// Launch an application on this node.
#[derive(Default)]
pub struct SubmitKernel {
    base: KernelBase,
    services: Option<Arc<ServiceContext>>,
    application: Option<Application>,
    records: Vec<String>,
}

impl SubmitKernel {
    pub fn new(application: Application) -> Self {
        Self {
            base: KernelBase::new_service(),
            services: None,
            application: Some(application),
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }
}

impl Kernel for SubmitKernel {
    kernel_base!(base);

    fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
        let verdict = match (&self.services, self.application.take()) {
            (Some(services), Some(app)) => services.submit(app),
            (None, _) => Err("not a daemon".to_string()),
            (_, None) => Err("no application in request".to_string()),
        };
        match verdict {
            Ok(id) => {
                self.records = vec![format!("application={id}")];
                self.base.set_result(ExitCode::Success);
            }
            Err(message) => {
                error!(message, "submit failed");
                self.records = vec![message];
                self.base.set_result(ExitCode::Error);
            }
        }
        Step::Return
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base().write(out);
        match &self.application {
            Some(app) => {
                out.write_bool(true);
                app.write(out);
            }
            None => out.write_bool(false),
        }
        write_records(out, &self.records);
        Ok(())
    }

    fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base_mut().read(buf)?;
        self.application = if buf.read_bool()? { Some(Application::read(buf)?) } else { None };
        self.records = read_records(buf)?;
        Ok(())
    }
}

/// One record per interface hierarchy.
#[derive(Default)]
pub struct StatusKernel {
    base: KernelBase,
    services: Option<Arc<ServiceContext>>,
    records: Vec<String>,
}

impl StatusKernel {
    pub fn new() -> Self {
        Self { base: KernelBase::new_service(), ..Default::default() }
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }
}

impl Kernel for StatusKernel {
    kernel_base!(base);

    fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
        if let Some(services) = &self.services {
            self.records = services.hierarchy_records();
            self.base.set_result(ExitCode::Success);
        } else {
            self.base.set_result(ExitCode::Error);
        }
        Step::Return
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base().write(out);
        write_records(out, &self.records);
        Ok(())
    }

    fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base_mut().read(buf)?;
        self.records = read_records(buf)?;
        Ok(())
    }
}

/// One record per hosted application.
#[derive(Default)]
pub struct JobStatusKernel {
    base: KernelBase,
    services: Option<Arc<ServiceContext>>,
    records: Vec<String>,
}

impl JobStatusKernel {
    pub fn new() -> Self {
        Self { base: KernelBase::new_service(), ..Default::default() }
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }
}

impl Kernel for JobStatusKernel {
    kernel_base!(base);

    fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
        if let Some(services) = &self.services {
            self.records = services.job_records();
            self.base.set_result(ExitCode::Success);
        } else {
            self.base.set_result(ExitCode::Error);
        }
        Step::Return
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base().write(out);
        write_records(out, &self.records);
        Ok(())
    }

    fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base_mut().read(buf)?;
        self.records = read_records(buf)?;
        Ok(())
    }
}

/// Tear a hosted application down.
#[derive(Default)]
pub struct TerminateKernel {
    base: KernelBase,
    services: Option<Arc<ServiceContext>>,
    application: u64,
    records: Vec<String>,
}

impl TerminateKernel {
    pub fn new(application: u64) -> Self {
        Self { base: KernelBase::new_service(), application, ..Default::default() }
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }
}

impl Kernel for TerminateKernel {
    kernel_base!(base);

    fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
        let verdict = match &self.services {
            Some(services) => services.terminate(self.application),
            None => Err("not a daemon".to_string()),
        };
        match verdict {
            Ok(()) => {
                self.records = vec![format!("terminated={}", self.application)];
                self.base.set_result(ExitCode::Success);
            }
            Err(message) => {
                self.records = vec![message];
                self.base.set_result(ExitCode::Error);
            }
        }
        Step::Return
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base().write(out);
        out.write_u64(self.application);
        write_records(out, &self.records);
        Ok(())
    }

    fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base_mut().read(buf)?;
        self.application = buf.read_u64()?;
        self.records = read_records(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::{IdRange, Router};
    use pretty_assertions::assert_eq;

    struct NullRouter;

    impl Router for NullRouter {
        fn send(&self, _k: kernel::KernelPtr) {}

        fn send_remote(&self, _k: kernel::KernelPtr) {}

        fn forward(&self, _k: kernel::ForeignKernel) {}
    }

    #[test]
    fn submit_round_trip_carries_the_descriptor() {
        let mut app = Application::new(vec!["/usr/bin/hello".into(), "10".into()]);
        app.set_credentials(1000, 100);
        let id = app.id();
        let submit = SubmitKernel::new(app);
        let mut buf = KernelBuffer::new();
        submit.write(&mut buf).unwrap();

        let mut restored = SubmitKernel::default();
        restored.read(&mut buf).unwrap();
        assert_eq!(restored.application.as_ref().map(Application::id), Some(id));
    }

    #[test]
    fn status_without_context_fails_cleanly() {
        let router = NullRouter;
        let ids = IdRange::default();
        let mut ctx = Context::new(&router, &ids);
        let mut status = StatusKernel::new();
        let step = status.act(&mut ctx);
        assert_eq!(step, Step::Return);
        assert_eq!(status.base().result(), ExitCode::Error);
    }

    #[test]
    fn status_reports_hierarchy_records() {
        let discovery = Arc::new(DiscoveryState::default());
        discovery.add_interface("10.0.0.2/16".parse().unwrap());
        let services = Arc::new(ServiceContext::new(discovery));

        let router = NullRouter;
        let ids = IdRange::default();
        let mut ctx = Context::new(&router, &ids);
        let mut status = StatusKernel { services: Some(services), ..Default::default() };
        status.act(&mut ctx);
        assert_eq!(status.base().result(), ExitCode::Success);
        assert_eq!(status.records().len(), 1);
        assert!(status.records()[0].contains("10.0.0.2/16"));
    }

    #[test]
    fn terminate_response_round_trip() {
        let mut terminate = TerminateKernel::new(77);
        terminate.records = vec!["terminated=77".to_string()];
        terminate.base_mut().set_result(ExitCode::Success);
        let mut buf = KernelBuffer::new();
        terminate.write(&mut buf).unwrap();

        let mut restored = TerminateKernel::default();
        restored.read(&mut buf).unwrap();
        assert_eq!(restored.application, 77);
        assert_eq!(restored.records(), ["terminated=77".to_string()]);
        assert_eq!(restored.base().result(), ExitCode::Success);
    }
}
