//! Template rendering for job trees.
//!
//! Files named `*.tmpl` are rendered and written without the suffix.
//! Placeholders take the form `{{ scope.key }}`:
//!
//! | expression               | value                                        |
//! |--------------------------|----------------------------------------------|
//! | `global.KEY`             | KV `global`                                  |
//! | `worker.ip` / `.ordinal` / `.memory_mb` / `.cpu_mhz` | this worker     |
//! | `worker.KEY`             | KV `worker/<ip>`                             |
//! | `tags.KEY`               | this worker's tags                           |
//! | `job.name` / `.version`  | this job                                     |
//! | `job.KEY`                | KV `job/<job>`                               |
//! | `alloc.KEY`              | KV `job/<job>/<ip>`                          |
//! | `port.NAME`              | the job's declared port                      |
//! | `workers.LABEL`          | comma-separated IPs carrying the label       |
//! | `workers.LABEL.N`        | the N-th of those, by ordinal                |
//! | `kv("NS", "KEY")`        | raw access, limited to the namespaces above  |
//!
//! Anything else, and any missing value, is an error.

use std::sync::LazyLock;

use hoist_core::{Job, Worker};
use hoist_state::{StateError, StateRead};
use regex::{Captures, Regex};
use thiserror::Error;

/// Suffix marking a template file.
pub const TEMPLATE_SUFFIX: &str = ".tmpl";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("valid placeholder regex"));

static RAW_KV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^kv\(\s*"([^"]*)"\s*,\s*"([^"]*)"\s*\)$"#).expect("valid kv regex")
});

/// Template failures. All of them abort the deploy.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("malformed expression {0:?}")]
    Syntax(String),

    #[error("unknown scope in {0:?}")]
    UnknownScope(String),

    #[error("namespace {0:?} is not accessible from this template")]
    Forbidden(String),

    #[error("no value for {expr:?} in namespace {namespace:?}")]
    Missing { namespace: String, expr: String },

    #[error("no worker #{index} with label {label:?}")]
    NoWorker { label: String, index: usize },

    #[error("in {path}: {source}")]
    InFile {
        path: String,
        #[source]
        source: Box<RenderError>,
    },

    #[error("state lookup failed: {0}")]
    State(#[from] StateError),
}

/// What a template may see while rendering one job on one worker.
pub struct RenderContext<'a, S: StateRead> {
    pub state: &'a S,
    pub worker: &'a Worker,
    pub job: &'a Job,
    /// Every declared worker, ordered by ordinal.
    pub workers: &'a [Worker],
}

impl<S: StateRead> RenderContext<'_, S> {
    fn worker_ns(&self) -> String {
        format!("worker/{}", self.worker.ip)
    }

    fn job_ns(&self) -> String {
        format!("job/{}", self.job.name)
    }

    fn alloc_ns(&self) -> String {
        format!("job/{}/{}", self.job.name, self.worker.ip)
    }

    /// Namespaces reachable through `kv(...)`.
    fn allowed(&self, namespace: &str) -> bool {
        namespace == "global"
            || namespace == self.worker_ns()
            || namespace == self.job_ns()
            || namespace == self.alloc_ns()
    }

    fn lookup(&self, namespace: &str, key: &str, expr: &str) -> Result<String, RenderError> {
        if !self.allowed(namespace) {
            return Err(RenderError::Forbidden(namespace.to_string()));
        }
        self.state
            .kv_get(namespace, key)?
            .map(|entry| entry.value)
            .ok_or_else(|| RenderError::Missing {
                namespace: namespace.to_string(),
                expr: expr.to_string(),
            })
    }

    /// Resolve one placeholder expression.
    pub fn resolve(&self, expr: &str) -> Result<String, RenderError> {
        if let Some(caps) = RAW_KV.captures(expr) {
            return self.lookup(&caps[1], &caps[2], expr);
        }

        let mut parts = expr.split('.');
        let scope = parts.next().unwrap_or_default();
        let key = parts.next().filter(|k| !k.is_empty());
        let extra = parts.next();
        let Some(key) = key else {
            return Err(RenderError::Syntax(expr.to_string()));
        };
        if (extra.is_some() && scope != "workers") || parts.next().is_some() {
            return Err(RenderError::Syntax(expr.to_string()));
        }

        match scope {
            "global" => self.lookup("global", key, expr),
            "worker" => match key {
                "ip" => Ok(self.worker.ip.clone()),
                "ordinal" => Ok(self.worker.ordinal.to_string()),
                "memory_mb" => Ok(self.worker.memory_mb.to_string()),
                "cpu_mhz" => Ok(self.worker.cpu_mhz.to_string()),
                _ => self.lookup(&self.worker_ns(), key, expr),
            },
            "tags" => self
                .worker
                .tags
                .get(key)
                .cloned()
                .ok_or_else(|| RenderError::Missing {
                    namespace: "tags".to_string(),
                    expr: expr.to_string(),
                }),
            "job" => match key {
                "name" => Ok(self.job.name.clone()),
                "version" => Ok(self.job.version.clone()),
                _ => self.lookup(&self.job_ns(), key, expr),
            },
            "alloc" => self.lookup(&self.alloc_ns(), key, expr),
            "port" => self
                .job
                .ports
                .get(key)
                .map(u16::to_string)
                .ok_or_else(|| RenderError::Missing {
                    namespace: "port".to_string(),
                    expr: expr.to_string(),
                }),
            "workers" => self.workers_with_label(key, extra, expr),
            _ => Err(RenderError::UnknownScope(expr.to_string())),
        }
    }

    fn workers_with_label(
        &self,
        label: &str,
        index: Option<&str>,
        expr: &str,
    ) -> Result<String, RenderError> {
        let ips: Vec<&str> = self
            .workers
            .iter()
            .filter(|w| w.has_label(label))
            .map(|w| w.ip.as_str())
            .collect();

        match index {
            None => Ok(ips.join(",")),
            Some(raw) => {
                let index: usize = raw
                    .parse()
                    .map_err(|_| RenderError::Syntax(expr.to_string()))?;
                ips.get(index)
                    .map(|ip| ip.to_string())
                    .ok_or_else(|| RenderError::NoWorker {
                        label: label.to_string(),
                        index,
                    })
            }
        }
    }

    /// Render every placeholder in `template`.
    pub fn render(&self, template: &str) -> Result<String, RenderError> {
        let mut first_err = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
            match self.resolve(&caps[1]) {
                Ok(value) => value,
                Err(e) => {
                    first_err.get_or_insert(e);
                    String::new()
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_state::StateStore;

    struct Fixture {
        store: StateStore,
        workers: Vec<Worker>,
        job: Job,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|tx| {
                tx.kv_put("global", "domain", "example.org")?;
                tx.kv_put("worker/10.0.0.1", "rack", "r7")?;
                tx.kv_put("worker/10.0.0.2", "rack", "r9")?;
                tx.kv_put("job/web", "replicas", "3")?;
                tx.kv_put("job/web/10.0.0.1", "weight", "10")?;
                tx.kv_put("job/db", "password", "hunter2")
            })
            .unwrap();

        let mut first = Worker::new("10.0.0.1", 0).with_labels(["web"]);
        first.memory_mb = 2048;
        first.tags.insert("zone".to_string(), "a".to_string());
        let second = Worker::new("10.0.0.2", 1).with_labels(["web", "db"]);

        let mut job = Job::new("web");
        job.version = "1.2.0".to_string();
        job.ports.insert("http".to_string(), 8080);

        Fixture {
            store,
            workers: vec![first, second],
            job,
        }
    }

    fn ctx(f: &Fixture) -> RenderContext<'_, StateStore> {
        RenderContext {
            state: &f.store,
            worker: &f.workers[0],
            job: &f.job,
            workers: &f.workers,
        }
    }

    #[test]
    fn renders_every_scope() {
        let f = fixture();
        let out = ctx(&f)
            .render(
                "{{ global.domain }} {{worker.ip}} {{ worker.memory_mb }} {{ worker.rack }} \
                 {{ tags.zone }} {{ job.name }}@{{ job.version }} {{ job.replicas }} \
                 {{ alloc.weight }} {{ port.http }} {{ workers.web }} {{ workers.db.0 }}",
            )
            .unwrap();
        assert_eq!(
            out,
            "example.org 10.0.0.1 2048 r7 a web@1.2.0 3 10 8080 10.0.0.1,10.0.0.2 10.0.0.2"
        );
    }

    #[test]
    fn raw_kv_limited_to_own_namespaces() {
        let f = fixture();
        let c = ctx(&f);
        assert_eq!(c.render(r#"{{ kv("job/web", "replicas") }}"#).unwrap(), "3");

        let err = c.render(r#"{{ kv("job/db", "password") }}"#).unwrap_err();
        assert!(matches!(err, RenderError::Forbidden(ns) if ns == "job/db"));

        let err = c.render(r#"{{ kv("worker/10.0.0.2", "rack") }}"#).unwrap_err();
        assert!(matches!(err, RenderError::Forbidden(_)));
    }

    #[test]
    fn missing_values_are_errors() {
        let f = fixture();
        let c = ctx(&f);
        assert!(matches!(
            c.render("{{ global.nope }}").unwrap_err(),
            RenderError::Missing { .. }
        ));
        assert!(matches!(
            c.render("{{ port.grpc }}").unwrap_err(),
            RenderError::Missing { .. }
        ));
        assert!(matches!(
            c.render("{{ workers.web.5 }}").unwrap_err(),
            RenderError::NoWorker { index: 5, .. }
        ));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        let f = fixture();
        let c = ctx(&f);
        assert!(matches!(c.render("{{ global }}").unwrap_err(), RenderError::Syntax(_)));
        assert!(matches!(c.render("{{ job.a.b }}").unwrap_err(), RenderError::Syntax(_)));
        assert!(matches!(
            c.render("{{ secrets.key }}").unwrap_err(),
            RenderError::UnknownScope(_)
        ));
    }

    #[test]
    fn text_without_placeholders_passes_through() {
        let f = fixture();
        let text = "#!/bin/sh\necho ${HOME} {not a placeholder}\n";
        assert_eq!(ctx(&f).render(text).unwrap(), text);
    }
}
