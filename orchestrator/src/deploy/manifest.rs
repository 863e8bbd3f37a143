//! Build manifest generation

use crate::models::application::{RepositorySource, RuntimeKind};

pub const GENERATED_MANIFEST: &str = "Dockerfile.stackpilot";

/// Generate a Dockerfile for the repository's runtime
pub fn generate(repo: &RepositorySource, port: u16) -> String {
    let runtime = repo.effective_runtime();
    let build = repo.build_command.as_deref().filter(|c| !c.trim().is_empty());
    let start = repo.start_command.as_deref().filter(|c| !c.trim().is_empty());

    let mut lines: Vec<String> = Vec::new();
    match runtime {
        RuntimeKind::Node | RuntimeKind::NextJs | RuntimeKind::Auto => {
            lines.push("FROM node:20-alpine".to_string());
            lines.push("WORKDIR /app".to_string());
            lines.push("COPY package*.json ./".to_string());
            lines.push("RUN npm install".to_string());
            lines.push("COPY . .".to_string());
            let default_build = (runtime == RuntimeKind::NextJs).then_some("npm run build");
            if let Some(cmd) = build.or(default_build) {
                lines.push(format!("RUN {}", cmd));
            }
            lines.push(format!("ENV PORT={}", port));
            lines.push(format!("EXPOSE {}", port));
            lines.push(cmd_line(start.unwrap_or("npm start")));
        }
        RuntimeKind::Python => {
            lines.push("FROM python:3.12-slim".to_string());
            lines.push("WORKDIR /app".to_string());
            lines.push("COPY . .".to_string());
            lines.push(
                "RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; \
                 elif [ -f pyproject.toml ]; then pip install --no-cache-dir .; fi"
                    .to_string(),
            );
            if let Some(cmd) = build {
                lines.push(format!("RUN {}", cmd));
            }
            lines.push(format!("ENV PORT={}", port));
            lines.push(format!("EXPOSE {}", port));
            let default_start = format!("python -m http.server {}", port);
            lines.push(cmd_line(start.unwrap_or(&default_start)));
        }
        RuntimeKind::Go => {
            lines.push("FROM golang:1.22-alpine AS build".to_string());
            lines.push("WORKDIR /src".to_string());
            lines.push("COPY . .".to_string());
            lines.push(format!(
                "RUN {}",
                build.unwrap_or("CGO_ENABLED=0 go build -o /out/app .")
            ));
            lines.push("FROM alpine:3.20".to_string());
            lines.push("COPY --from=build /out/app /app".to_string());
            lines.push(format!("ENV PORT={}", port));
            lines.push(format!("EXPOSE {}", port));
            lines.push(cmd_line(start.unwrap_or("/app")));
        }
        RuntimeKind::Static => {
            lines.push("FROM nginx:alpine".to_string());
            lines.push("COPY . /usr/share/nginx/html".to_string());
            if port != 80 {
                lines.push(format!(
                    "RUN sed -i 's/listen       80;/listen       {};/' /etc/nginx/conf.d/default.conf",
                    port
                ));
            }
            lines.push(format!("EXPOSE {}", port));
        }
        RuntimeKind::Generic => {
            lines.push("FROM ubuntu:24.04".to_string());
            lines.push("WORKDIR /app".to_string());
            lines.push("COPY . .".to_string());
            if let Some(cmd) = build {
                lines.push(format!("RUN {}", cmd));
            }
            lines.push(format!("ENV PORT={}", port));
            lines.push(format!("EXPOSE {}", port));
            lines.push(cmd_line(start.unwrap_or("./start.sh")));
        }
    }

    let mut manifest = lines.join("\n");
    manifest.push('\n');
    manifest
}

/// Shell-form start command run through `sh -c`
fn cmd_line(command: &str) -> String {
    let escaped = serde_json::Value::String(command.to_string()).to_string();
    format!("CMD [\"sh\", \"-c\", {}]", escaped)
}
