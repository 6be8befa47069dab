use std::fmt::Write;

use super::PortAssignment;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where the rendered configuration is written inside the proxy container.
pub const NGINX_CONFIG_PATH: &str = "/etc/nginx/nginx.conf";

/// Writes `$1` to the config path and runs nginx in the foreground.
const NGINX_ENTRY_SCRIPT: &str =
    "printf '%s' \"$1\" > /etc/nginx/nginx.conf && exec nginx -g 'daemon off;'";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders an nginx stream configuration with one upstream and one server block per console.
///
/// Upstreams address workloads by container name, which the nested daemon resolves on every
/// range network the proxy is attached to.
pub fn render_stream_config(assignments: &[PortAssignment]) -> String {
    let mut config = String::from("worker_processes 1;\n\nevents {\n    worker_connections 1024;\n}\n\nstream {\n");

    for assignment in assignments {
        let upstream = format!("vm_{}", assignment.target.vm_id.simple());
        let _ = write!(
            config,
            "    upstream {upstream} {{\n        server {}:{};\n    }}\n\n    server {{\n        listen {};\n        proxy_pass {upstream};\n    }}\n\n",
            assignment.target.container_name, assignment.target.port, assignment.proxy_port,
        );
    }

    config.push_str("}\n");
    config
}

/// The command of the proxy container: write the configuration, then run nginx.
pub fn nginx_command(config: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        NGINX_ENTRY_SCRIPT.to_string(),
        "sh".to_string(),
        config.to_string(),
    ]
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use uuid::Uuid;

    use super::*;
    use crate::isolation::VncTarget;

    #[test]
    fn test_render_stream_config() {
        let vm_id = Uuid::new_v4();
        let config = render_stream_config(&[PortAssignment {
            target: VncTarget {
                vm_id,
                container_name: "cyroid-vm-ab12cd34-ws01".into(),
                ip: Ipv4Addr::new(10, 0, 1, 10),
                port: 6901,
            },
            proxy_port: 15900,
            is_new: true,
        }]);

        assert!(config.contains(&format!("upstream vm_{}", vm_id.simple())));
        assert!(config.contains("server cyroid-vm-ab12cd34-ws01:6901;"));
        assert!(config.contains("listen 15900;"));
        assert!(config.starts_with("worker_processes 1;"));
        assert!(config.trim_end().ends_with('}'));
    }

    #[test]
    fn test_config_is_passed_as_argument() {
        let command = nginx_command("stream {}");
        assert_eq!(command[0], "sh");
        assert_eq!(command[4], "stream {}");
        assert!(command[2].contains(NGINX_CONFIG_PATH));
    }
}
