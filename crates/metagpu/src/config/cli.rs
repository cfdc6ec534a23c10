use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the metagpu device plugin
    Start(Box<StartArgs>),
    /// Print version information
    Version,
}

#[derive(Parser, Clone, Debug)]
pub struct StartArgs {
    #[arg(
        long,
        env = "METAGPU_DEVICE_PLUGIN_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/metagpu-device-plugin/config.yaml",
        help = "Path of the plugin configuration file, watched for changes"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "METAGPU_DEVICE_PLUGIN_JSON_LOG",
        default_value_t = false,
        help = "Emit logs as JSON"
    )]
    pub json_log: bool,

    #[arg(
        long,
        short,
        env = "METAGPU_DEVICE_PLUGIN_VERBOSE",
        default_value_t = false,
        help = "Raise the default log level to debug"
    )]
    pub verbose: bool,

    #[arg(
        long,
        env = "METAGPU_DEVICE_PLUGIN_METAGPU_SERVER_ADDR",
        default_value = "0.0.0.0:50052",
        help = "Listen address of the management gRPC server"
    )]
    pub metagpu_server_addr: SocketAddr,

    #[arg(
        long,
        env = "METAGPU_DEVICE_PLUGIN_NODE_NAME",
        help = "Node name used to select the pods scheduled on this node"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "METAGPU_DEVICE_PLUGIN_ENABLE_K8S",
        help = "Enable Kubernetes pod and kubelet integration",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_k8s: bool,

    #[arg(
        long,
        env = "METAGPU_DEVICE_PLUGIN_KUBELET_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/lib/kubelet/device-plugins",
        help = "Kubelet device plugin directory holding kubelet.sock"
    )]
    pub kubelet_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "METAGPU_DEVICE_PLUGIN_KUBELET_POD_RESOURCES_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        help = "Kubelet pod resources socket used to track allocated metagpus"
    )]
    pub kubelet_pod_resources_socket: PathBuf,
}
