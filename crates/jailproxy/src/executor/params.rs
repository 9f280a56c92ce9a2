//! Argument binding for subprocess requests.
//!
//! Parameters, in positional order: `cmd, stdin, cwd, env, rlimits, realtime`.
//! Each may be passed positionally or by keyword, but not both. Null means "not given".

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::protocol::{Request, Value};

use super::ExecutorError;

const PARAMS: [&str; 6] = ["cmd", "stdin", "cwd", "env", "rlimits", "realtime"];

/// A POSIX resource that can be limited before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitResource {
    AddressSpace,
    Core,
    Cpu,
    Data,
    FileSize,
    OpenFiles,
    Processes,
    Stack,
}

impl RlimitResource {
    /// Parse `RLIMIT_CPU`, `rlimit_cpu` or `cpu`.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let short = upper.strip_prefix("RLIMIT_").unwrap_or(&upper);
        let resource = match short {
            "AS" => Self::AddressSpace,
            "CORE" => Self::Core,
            "CPU" => Self::Cpu,
            "DATA" => Self::Data,
            "FSIZE" => Self::FileSize,
            "NOFILE" => Self::OpenFiles,
            "NPROC" => Self::Processes,
            "STACK" => Self::Stack,
            _ => return None,
        };
        Some(resource)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AddressSpace => "RLIMIT_AS",
            Self::Core => "RLIMIT_CORE",
            Self::Cpu => "RLIMIT_CPU",
            Self::Data => "RLIMIT_DATA",
            Self::FileSize => "RLIMIT_FSIZE",
            Self::OpenFiles => "RLIMIT_NOFILE",
            Self::Processes => "RLIMIT_NPROC",
            Self::Stack => "RLIMIT_STACK",
        }
    }
}

/// One resource limit. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitSpec {
    pub resource: RlimitResource,
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

/// A fully validated subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessSpec {
    /// Program followed by its arguments; never empty.
    pub cmd: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    /// Replaces the inherited environment when set.
    pub env: Option<Vec<(String, String)>>,
    pub rlimits: Vec<RlimitSpec>,
    pub realtime: Option<Duration>,
}

impl SubprocessSpec {
    pub fn from_request(request: &Request) -> Result<Self, ExecutorError> {
        if request.args.len() > PARAMS.len() {
            return Err(ExecutorError::invalid(format!(
                "takes at most {} positional arguments ({} given)",
                PARAMS.len(),
                request.args.len()
            )));
        }

        let mut bound: [Option<&Value>; 6] = [None; 6];
        for (slot, value) in bound.iter_mut().zip(&request.args) {
            *slot = Some(value);
        }
        for (key, value) in &request.kwargs {
            let idx = PARAMS
                .iter()
                .position(|p| *p == key.as_str())
                .ok_or_else(|| ExecutorError::invalid(format!("unexpected keyword argument '{key}'")))?;
            if bound[idx].is_some() {
                return Err(ExecutorError::invalid(format!(
                    "got multiple values for argument '{key}'"
                )));
            }
            bound[idx] = Some(value);
        }

        // Explicit nulls behave like omitted arguments.
        let [cmd, stdin, cwd, env, rlimits, realtime] = bound.map(|v| v.filter(|v| !v.is_null()));

        let cmd = parse_cmd(cmd.ok_or_else(|| ExecutorError::invalid("missing required argument 'cmd'"))?)?;

        let stdin = stdin
            .map(|v| {
                v.as_byte_slice()
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| type_error("stdin", "bytes or str", v))
            })
            .transpose()?;

        let cwd = cwd
            .map(|v| {
                v.as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| type_error("cwd", "str", v))
            })
            .transpose()?;

        let env = env.map(parse_env).transpose()?;
        let rlimits = rlimits.map(parse_rlimits).transpose()?.unwrap_or_default();
        let realtime = realtime.map(parse_realtime).transpose()?.flatten();

        Ok(Self {
            cmd,
            stdin,
            cwd,
            env,
            rlimits,
            realtime,
        })
    }

    pub fn program(&self) -> &str {
        &self.cmd[0]
    }

    pub fn args(&self) -> &[String] {
        &self.cmd[1..]
    }
}

fn type_error(param: &str, expected: &str, got: &Value) -> ExecutorError {
    ExecutorError::invalid(format!(
        "'{param}' must be {expected}, got {}",
        got.kind()
    ))
}

fn parse_cmd(value: &Value) -> Result<Vec<String>, ExecutorError> {
    let cmd = match value {
        Value::Str(program) => vec![program.clone()],
        Value::List(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| type_error("cmd item", "str", item))
            })
            .collect::<Result<Vec<_>, _>>()?,
        other => return Err(type_error("cmd", "list of str or str", other)),
    };
    if cmd.first().is_none_or(|program| program.is_empty()) {
        return Err(ExecutorError::invalid("'cmd' must name a program"));
    }
    Ok(cmd)
}

fn parse_env(value: &Value) -> Result<Vec<(String, String)>, ExecutorError> {
    let map = value
        .as_map()
        .ok_or_else(|| type_error("env", "map of str", value))?;
    map.iter()
        .map(|(key, v)| {
            v.as_str()
                .map(|s| (key.clone(), s.to_string()))
                .ok_or_else(|| type_error(&format!("env['{key}']"), "str", v))
        })
        .collect()
}

fn parse_limit(value: &Value) -> Result<Option<u64>, ExecutorError> {
    match value.as_int() {
        Some(n) if n < 0 => Ok(None),
        Some(n) => Ok(Some(n as u64)),
        None => Err(type_error("rlimit value", "int", value)),
    }
}

fn parse_rlimits(value: &Value) -> Result<Vec<RlimitSpec>, ExecutorError> {
    let entries = value
        .as_list()
        .ok_or_else(|| type_error("rlimits", "list", value))?;

    entries
        .iter()
        .map(|entry| {
            let [resource, limit] = entry.as_list().unwrap_or_default() else {
                return Err(ExecutorError::invalid(
                    "each rlimit must be a [resource, limit] pair",
                ));
            };
            let name = resource
                .as_str()
                .ok_or_else(|| type_error("rlimit resource", "str", resource))?;
            let resource = RlimitResource::from_name(name)
                .ok_or_else(|| ExecutorError::invalid(format!("unknown rlimit resource '{name}'")))?;

            let (soft, hard) = match limit {
                Value::List(pair) => match pair.as_slice() {
                    [soft, hard] => (parse_limit(soft)?, parse_limit(hard)?),
                    _ => {
                        return Err(ExecutorError::invalid(
                            "rlimit limit pair must be [soft, hard]",
                        ));
                    }
                },
                single => {
                    let limit = parse_limit(single)?;
                    (limit, limit)
                }
            };

            Ok(RlimitSpec {
                resource,
                soft,
                hard,
            })
        })
        .collect()
}

/// Zero means no wall-clock limit.
fn parse_realtime(value: &Value) -> Result<Option<Duration>, ExecutorError> {
    match value.as_int() {
        Some(0) => Ok(None),
        Some(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs as u64))),
        Some(secs) => Err(ExecutorError::invalid(format!(
            "'realtime' must not be negative, got {secs}"
        ))),
        None => Err(type_error("realtime", "int", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Kwargs;

    fn cmd(parts: &[&str]) -> Value {
        Value::List(parts.iter().map(|p| Value::from(*p)).collect())
    }

    fn invalid_message(request: Request) -> String {
        match SubprocessSpec::from_request(&request) {
            Err(ExecutorError::InvalidArguments(msg)) => msg,
            other => panic!("expected invalid arguments, got {other:?}"),
        }
    }

    #[test]
    fn binds_positional_arguments() {
        let mut env = Kwargs::new();
        env.insert("PATH".to_string(), Value::from("/usr/bin"));
        let request = Request::positional([
            cmd(&["cat", "-n"]),
            Value::from(b"data".to_vec()),
            Value::from("/tmp"),
            Value::Map(env),
        ]);

        let spec = SubprocessSpec::from_request(&request).unwrap();
        assert_eq!(spec.program(), "cat");
        assert_eq!(spec.args(), ["-n"]);
        assert_eq!(spec.stdin.as_deref(), Some(&b"data"[..]));
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(
            spec.env,
            Some(vec![("PATH".to_string(), "/usr/bin".to_string())])
        );
        assert!(spec.rlimits.is_empty());
        assert_eq!(spec.realtime, None);
    }

    #[test]
    fn binds_keyword_arguments() {
        let request = Request::default()
            .with_kwarg("cmd", "true")
            .with_kwarg("stdin", "text input")
            .with_kwarg("realtime", 5);

        let spec = SubprocessSpec::from_request(&request).unwrap();
        assert_eq!(spec.cmd, ["true"]);
        assert_eq!(spec.stdin.as_deref(), Some(&b"text input"[..]));
        assert_eq!(spec.realtime, Some(Duration::from_secs(5)));
    }

    #[test]
    fn nulls_are_omitted_arguments() {
        let request = Request::positional([cmd(&["ls"]), Value::Null, Value::Null])
            .with_kwarg("rlimits", Value::Null);

        let spec = SubprocessSpec::from_request(&request).unwrap();
        assert_eq!(spec.stdin, None);
        assert_eq!(spec.cwd, None);
        assert!(spec.rlimits.is_empty());
    }

    #[test]
    fn zero_realtime_means_no_limit() {
        let request = Request::positional([cmd(&["ls"])]).with_kwarg("realtime", 0);
        let spec = SubprocessSpec::from_request(&request).unwrap();
        assert_eq!(spec.realtime, None);

        let request = Request::positional([
            cmd(&["ls"]),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
            Value::from(0),
        ]);
        assert_eq!(SubprocessSpec::from_request(&request).unwrap().realtime, None);
    }

    #[test]
    fn parses_rlimits() {
        let request = Request::positional([cmd(&["ls"])]).with_kwarg(
            "rlimits",
            Value::List(vec![
                Value::List(vec![Value::from("RLIMIT_CPU"), Value::from(1)]),
                Value::List(vec![
                    Value::from("as"),
                    Value::List(vec![Value::from(1 << 20), Value::from(-1)]),
                ]),
            ]),
        );

        let spec = SubprocessSpec::from_request(&request).unwrap();
        assert_eq!(
            spec.rlimits,
            [
                RlimitSpec {
                    resource: RlimitResource::Cpu,
                    soft: Some(1),
                    hard: Some(1),
                },
                RlimitSpec {
                    resource: RlimitResource::AddressSpace,
                    soft: Some(1 << 20),
                    hard: None,
                },
            ]
        );
    }

    #[test]
    fn resource_names() {
        assert_eq!(RlimitResource::from_name("RLIMIT_NOFILE"), Some(RlimitResource::OpenFiles));
        assert_eq!(RlimitResource::from_name("rlimit_fsize"), Some(RlimitResource::FileSize));
        assert_eq!(RlimitResource::from_name("nproc"), Some(RlimitResource::Processes));
        assert_eq!(RlimitResource::from_name("RLIMIT_RSS"), None);
        assert_eq!(RlimitResource::Stack.name(), "RLIMIT_STACK");
    }

    #[test]
    fn rejects_missing_cmd() {
        let msg = invalid_message(Request::default().with_kwarg("cwd", "/"));
        assert_eq!(msg, "missing required argument 'cmd'");
    }

    #[test]
    fn rejects_empty_cmd() {
        let msg = invalid_message(Request::positional([Value::List(Vec::new())]));
        assert_eq!(msg, "'cmd' must name a program");
    }

    #[test]
    fn rejects_duplicate_argument() {
        let request = Request::positional([cmd(&["ls"])]).with_kwarg("cmd", "ls");
        assert_eq!(
            invalid_message(request),
            "got multiple values for argument 'cmd'"
        );
    }

    #[test]
    fn rejects_unknown_keyword() {
        let request = Request::positional([cmd(&["ls"])]).with_kwarg("shell", true);
        assert_eq!(
            invalid_message(request),
            "unexpected keyword argument 'shell'"
        );
    }

    #[test]
    fn rejects_too_many_positionals() {
        let request = Request::positional(std::iter::repeat_n(Value::Null, 7));
        assert_eq!(
            invalid_message(request),
            "takes at most 6 positional arguments (7 given)"
        );
    }

    #[test]
    fn rejects_wrong_types() {
        let request = Request::positional([cmd(&["ls"]), Value::from(3)]);
        assert_eq!(invalid_message(request), "'stdin' must be bytes or str, got int");

        let request = Request::positional([Value::List(vec![Value::from(1)])]);
        assert_eq!(invalid_message(request), "'cmd item' must be str, got int");

        let request = Request::positional([cmd(&["ls"])]).with_kwarg("realtime", -1);
        assert_eq!(invalid_message(request), "'realtime' must not be negative, got -1");

        let request = Request::positional([cmd(&["ls"])]).with_kwarg(
            "rlimits",
            Value::List(vec![Value::List(vec![Value::from("RLIMIT_CPU")])]),
        );
        assert_eq!(
            invalid_message(request),
            "each rlimit must be a [resource, limit] pair"
        );
    }
}
