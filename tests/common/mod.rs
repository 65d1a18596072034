//! Test utilities and common setup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;

use code_executor::api::{self, AppState};
use code_executor::container::{
    ContainerConfig, ContainerResult, ContainerRuntimeApi, ExecOutput, LabelledContainer,
};
use code_executor::environments::{CatalogDefaults, EnvironmentConfig, EnvironmentRegistry};
use code_executor::executor::{ExecutorConfig, SandboxExecutor};
use code_executor::session::SessionService;
use code_executor::store::{MemoryStore, SessionStore};
use code_executor::tasks::{TaskRuntime, TaskWorker};

/// Container runtime fake with a tiny scripted interpreter.
///
/// The write exec (`sh -c "cat > ..."`) captures the submitted source; the
/// run exec (wrapped in `timeout`) produces output keyed off that source,
/// which is enough to drive every end-to-end scenario without a container
/// runtime on the test host.
#[derive(Default)]
pub struct FakeSandbox {
    containers: Mutex<Vec<LabelledContainer>>,
    last_code: Mutex<String>,
    counter: Mutex<usize>,
}

impl FakeSandbox {
    fn interpret(&self, code: &str) -> ExecOutput {
        if code.contains("while True") {
            return ExecOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: 124,
            };
        }
        if code.contains("raise ValueError") {
            return ExecOutput {
                stdout: Vec::new(),
                stderr: b"Traceback (most recent call last):\nValueError: x\n".to_vec(),
                exit_code: 1,
            };
        }
        if code.contains("print(2+3)") {
            return ExecOutput {
                stdout: b"5\n".to_vec(),
                stderr: Vec::new(),
                exit_code: 0,
            };
        }
        if code.contains("print('hi')") {
            return ExecOutput {
                stdout: b"hi\n".to_vec(),
                stderr: Vec::new(),
                exit_code: 0,
            };
        }
        ExecOutput::default()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeSandbox {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let id = format!("sandbox-{}", *counter);
        self.containers.lock().unwrap().push(LabelledContainer {
            id: id.clone(),
            labels: config.labels.clone(),
        });
        Ok(id)
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.containers
            .lock()
            .unwrap()
            .retain(|c| c.id != container_id);
        Ok(())
    }

    async fn exec_captured(
        &self,
        _container_id: &str,
        _user: Option<&str>,
        command: &[String],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<ExecOutput> {
        if command.first().map(String::as_str) == Some("timeout") {
            let code = self.last_code.lock().unwrap().clone();
            return Ok(self.interpret(&code));
        }
        // Write exec: remember the submitted source
        if let Some(bytes) = stdin {
            *self.last_code.lock().unwrap() = String::from_utf8_lossy(bytes).into_owned();
        }
        Ok(ExecOutput::default())
    }

    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(true)
    }

    async fn list_labelled(&self, _label_filter: &str) -> ContainerResult<Vec<LabelledContainer>> {
        Ok(self.containers.lock().unwrap().clone())
    }
}

fn test_environment(name: &str, description: &str) -> EnvironmentConfig {
    EnvironmentConfig {
        name: name.to_string(),
        image: name.to_string(),
        default_filename: "main.py".to_string(),
        file_extension: ".py".to_string(),
        run_command: "python {file_path}".to_string(),
        compile_command: None,
        description: description.to_string(),
        enabled: true,
    }
}

/// A fully wired application over in-memory backends.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub sandbox: Arc<FakeSandbox>,
}

/// Create a test application with all services initialized.
pub fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new(Duration::from_secs(3600)));
    let sandbox = Arc::new(FakeSandbox::default());

    let registry = Arc::new(EnvironmentRegistry::from_parts(
        CatalogDefaults::default(),
        vec![
            test_environment("python", "Python 3.12"),
            test_environment("node", "Node.js 22"),
        ],
    ));

    let executor = Arc::new(SandboxExecutor::new(
        sandbox.clone(),
        registry.clone(),
        ExecutorConfig {
            image_prefix: "code-executor".to_string(),
            workspace_dir: "/workspace".to_string(),
            executor_user: "executor".to_string(),
            memory_limit: "256m".to_string(),
            cpu_limit: 0.5,
            pids_limit: 50,
            execution_timeout: 5,
            network_disabled: true,
            read_only: false,
            no_new_privileges: true,
            tmpfs_size: "64m".to_string(),
        },
    ));

    let store_dyn: Arc<dyn SessionStore> = store.clone();
    let worker = TaskWorker::new(store_dyn.clone(), executor);
    let tasks = TaskRuntime::start(
        worker,
        2,
        Duration::from_secs(15),
        Duration::from_secs(35),
    );

    let service = SessionService::new(store_dyn, registry, tasks, Duration::from_secs(5));
    let router = api::create_router(AppState::new(service));

    TestApp {
        router,
        store,
        sandbox,
    }
}
