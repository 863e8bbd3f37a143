//! Remote deployment script
//!
//! The script is a list of typed [`Step`]s rendered to shell lines only at the
//! end, so its contents can be asserted without a transport.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

const HOST_MANIFEST: &str = "Dockerfile.stackpilot";
const GIT_AUTH_VAR: &str = "STACKPILOT_GIT_AUTH";

/// Where the container image comes from on the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStep {
    /// Pull a registry image
    Pull(String),

    /// Clone the repository on the host and build it there
    Build(HostBuild),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBuild {
    /// Repository URL without credentials
    pub clone_url: String,
    pub branch: String,
    /// Where the host reads the source token from, for private repositories
    pub token_parameter: Option<SecretParameter>,
    /// Generated manifest; `None` uses the repository's own `Dockerfile`
    pub manifest: Option<String>,
    pub tag: String,
}

/// An encrypted provider parameter the host fetches at run time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretParameter {
    pub name: String,
    pub region: String,
}

/// One unit of work on the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    EnsureContainerRuntime,
    RemoveContainer { name: String },
    Pull { image: String },
    BuildOnHost { build: HostBuild, workdir: String },
    Run {
        name: String,
        image: String,
        port: u16,
        env: BTreeMap<String, String>,
    },
}

/// Deploy one container on a virtual machine
#[derive(Debug, Clone)]
pub struct DeployScript {
    container_name: String,
    image: ImageStep,
    port: u16,
    env: BTreeMap<String, String>,
}

impl DeployScript {
    pub fn new(container_name: impl Into<String>, image: ImageStep, port: u16) -> Self {
        Self {
            container_name: container_name.into(),
            image,
            port,
            env: BTreeMap::new(),
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn steps(&self) -> Vec<Step> {
        let mut steps = vec![
            Step::EnsureContainerRuntime,
            Step::RemoveContainer {
                name: self.container_name.clone(),
            },
        ];
        let image = match &self.image {
            ImageStep::Pull(image) => {
                steps.push(Step::Pull {
                    image: image.clone(),
                });
                image.clone()
            }
            ImageStep::Build(build) => {
                steps.push(Step::BuildOnHost {
                    build: build.clone(),
                    workdir: format!("/tmp/stackpilot-{}", self.container_name),
                });
                build.tag.clone()
            }
        };
        steps.push(Step::Run {
            name: self.container_name.clone(),
            image,
            port: self.port,
            env: self.env.clone(),
        });
        steps
    }

    /// Shell lines for the remote command channel
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec!["set -e".to_string()];
        for step in self.steps() {
            lines.extend(step.render());
        }
        lines
    }
}

impl Step {
    pub fn render(&self) -> Vec<String> {
        match self {
            Step::EnsureContainerRuntime => vec![
                "if ! command -v docker >/dev/null 2>&1; then \
                 if command -v yum >/dev/null 2>&1; then yum install -y docker; \
                 elif command -v apt-get >/dev/null 2>&1; then apt-get update -y && apt-get install -y docker.io; \
                 else curl -fsSL https://get.docker.com | sh; fi; fi"
                    .to_string(),
                "systemctl enable --now docker >/dev/null 2>&1 || service docker start".to_string(),
            ],
            Step::RemoveContainer { name } => {
                let name = shell_quote(name);
                vec![
                    format!("docker stop {} >/dev/null 2>&1 || true", name),
                    format!("docker rm {} >/dev/null 2>&1 || true", name),
                ]
            }
            Step::Pull { image } => vec![format!("docker pull {}", shell_quote(image))],
            Step::BuildOnHost { build, workdir } => {
                let dir = shell_quote(workdir);
                let mut lines = vec![
                    "if ! command -v git >/dev/null 2>&1; then \
                     if command -v yum >/dev/null 2>&1; then yum install -y git; \
                     else apt-get install -y git; fi; fi"
                        .to_string(),
                    format!("rm -rf {}", dir),
                ];
                let clone = format!(
                    "clone --depth 1 --single-branch --branch {} {} {}",
                    shell_quote(&build.branch),
                    shell_quote(&build.clone_url),
                    dir
                );
                match &build.token_parameter {
                    // The token only ever exists in the host shell's environment
                    Some(parameter) => {
                        lines.push(format!(
                            "{}=\"$(printf 'x-access-token:%s' \"$(aws ssm get-parameter --name {} \
                             --with-decryption --query Parameter.Value --output text --region {})\" \
                             | base64 | tr -d '\\n')\"",
                            GIT_AUTH_VAR,
                            shell_quote(&parameter.name),
                            shell_quote(&parameter.region)
                        ));
                        lines.push(format!(
                            "git -c http.extraHeader=\"Authorization: Basic ${}\" {}",
                            GIT_AUTH_VAR, clone
                        ));
                        lines.push(format!("unset {}", GIT_AUTH_VAR));
                    }
                    None => lines.push(format!("git {}", clone)),
                }
                let manifest = match &build.manifest {
                    Some(contents) => {
                        let path = format!("{}/{}", workdir, HOST_MANIFEST);
                        lines.push(format!(
                            "echo {} | base64 -d > {}",
                            shell_quote(&BASE64.encode(contents)),
                            shell_quote(&path)
                        ));
                        path
                    }
                    None => format!("{}/Dockerfile", workdir),
                };
                lines.push(format!(
                    "docker build -t {} -f {} {}",
                    shell_quote(&build.tag),
                    shell_quote(&manifest),
                    dir
                ));
                lines.push(format!("rm -rf {}", dir));
                lines
            }
            Step::Run {
                name,
                image,
                port,
                env,
            } => {
                let mut cmd = format!(
                    "docker run -d --name {} --restart on-failure -p {}:{}",
                    shell_quote(name),
                    port,
                    port
                );
                for (key, value) in env {
                    cmd.push_str(" -e ");
                    cmd.push_str(&shell_quote(&format!("{}={}", key, value)));
                }
                cmd.push(' ');
                cmd.push_str(&shell_quote(image));
                vec![cmd]
            }
        }
    }
}

/// Single-quote for POSIX shells
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
