use clap::{value_parser, Arg, ArgAction, Command};

/// Build the CLI instance
pub fn build_cli() -> Command {
    let name_arg = Arg::new("NAME").required(true).num_args(1);
    let service_arg = Arg::new("SERVICE").required(true).num_args(1);
    let domain_arg = Arg::new("DOMAIN").required(true).num_args(1);
    let force_flag = Arg::new("force")
        .long("force")
        .action(ArgAction::SetTrue)
        .help("Proceed even if the target already exists");
    let rebuild_flag = Arg::new("rebuild")
        .long("rebuild")
        .action(ArgAction::SetTrue)
        .help("Pass the no-cache hint to the image build");
    let force_port_flag = Arg::new("force-port")
        .long("force-port")
        .action(ArgAction::SetTrue)
        .help("Start even if a host port is bound by an unrelated process");

    Command::new("net-servers")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A declarative control plane for containerized network services")
        .arg_required_else_help(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Render structured JSON output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Suppress log output"),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .global(true)
                .value_parser(value_parser!(String))
                .help("Override the current environment for this invocation"),
        )
        .arg(
            Arg::new("base")
                .long("base")
                .global(true)
                .value_parser(value_parser!(String))
                .help("Override base path resolution"),
        )
        .subcommand(Command::new("version").about("Display the version"))
        .subcommand(
            Command::new("environments")
                .alias("env")
                .about("Manage deployment environments")
                .arg_required_else_help(true)
                .subcommand(Command::new("list").alias("ls").about("List environments"))
                .subcommand(Command::new("current").about("Show the current environment"))
                .subcommand(
                    Command::new("add")
                        .about("Register a new environment")
                        .arg(name_arg.clone())
                        .arg(
                            Arg::new("base-path")
                                .long("base-path")
                                .required(true)
                                .help("Base directory of the environment tree"),
                        )
                        .arg(
                            Arg::new("domain")
                                .long("domain")
                                .required(true)
                                .help("Primary domain of the environment"),
                        )
                        .arg(
                            Arg::new("admin-email")
                                .long("admin-email")
                                .required(true)
                                .help("Administrative contact address"),
                        )
                        .arg(
                            Arg::new("description")
                                .long("description")
                                .help("Free-form description"),
                        )
                        .arg(
                            Arg::new("tag")
                                .long("tag")
                                .action(ArgAction::Append)
                                .help("Attach a tag (repeatable)"),
                        ),
                )
                .subcommand(
                    Command::new("remove")
                        .alias("rm")
                        .about("Remove an environment")
                        .arg(name_arg.clone())
                        .arg(
                            Arg::new("yes")
                                .short('y')
                                .long("yes")
                                .action(ArgAction::SetTrue)
                                .help("Do not ask for confirmation"),
                        ),
                )
                .subcommand(
                    Command::new("enable")
                        .about("Enable an environment")
                        .arg(name_arg.clone()),
                )
                .subcommand(
                    Command::new("disable")
                        .about("Disable an environment")
                        .arg(name_arg.clone()),
                )
                .subcommand(
                    Command::new("switch")
                        .about("Make an environment current")
                        .arg(name_arg.clone()),
                )
                .subcommand(
                    Command::new("info")
                        .about("Show one environment in detail")
                        .arg(name_arg.clone()),
                )
                .subcommand(
                    Command::new("init")
                        .about("Initialize the environment registry")
                        .arg(force_flag.clone()),
                )
                .subcommand(Command::new("validate").about("Validate the environment registry")),
        )
        .subcommand(
            Command::new("container")
                .about("Build and drive the service containers")
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("build")
                        .about("Build a service image")
                        .arg(service_arg.clone())
                        .arg(rebuild_flag.clone()),
                )
                .subcommand(
                    Command::new("run")
                        .about("Start a service container")
                        .arg(service_arg.clone())
                        .arg(force_port_flag.clone()),
                )
                .subcommand(
                    Command::new("stop")
                        .about("Stop a service container")
                        .arg(service_arg.clone()),
                )
                .subcommand(
                    Command::new("remove")
                        .alias("rm")
                        .about("Remove a service container")
                        .arg(service_arg.clone()),
                )
                .subcommand(
                    Command::new("logs")
                        .about("Show a container's logs")
                        .arg(service_arg.clone()),
                )
                .subcommand(Command::new("list").alias("ls").about("List managed containers"))
                .subcommand(
                    Command::new("test")
                        .about("Run a service's self-test inside its container")
                        .arg(service_arg.clone()),
                )
                .subcommand(
                    Command::new("build-all")
                        .about("Build every service image")
                        .arg(rebuild_flag.clone()),
                )
                .subcommand(
                    Command::new("start-all")
                        .about("Start every service container")
                        .arg(force_port_flag.clone()),
                )
                .subcommand(Command::new("stop-all").about("Stop every service container"))
                .subcommand(Command::new("remove-all").about("Remove every service container"))
                .subcommand(
                    Command::new("clean-all")
                        .about("Stop and remove every managed container of the environment"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage and materialize the configuration store")
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("init").about("Write documented defaults for missing documents"),
                )
                .subcommand(Command::new("validate").about("Validate the full configuration"))
                .subcommand(
                    Command::new("sync")
                        .about("Reconcile every synchronizer once")
                        .arg(
                            Arg::new("dry-run")
                                .long("dry-run")
                                .action(ArgAction::SetTrue)
                                .help("Compute the plan diff without touching disk"),
                        ),
                )
                .subcommand(
                    Command::new("watch")
                        .about("Watch the config directory and reconcile on changes"),
                )
                .subcommand(
                    Command::new("user")
                        .about("Manage user accounts")
                        .arg_required_else_help(true)
                        .subcommand(
                            Command::new("add")
                                .about("Add a user")
                                .arg(Arg::new("USERNAME").required(true))
                                .arg(
                                    Arg::new("email")
                                        .long("email")
                                        .required(true)
                                        .help("Contact address"),
                                )
                                .arg(
                                    Arg::new("domain")
                                        .long("domain")
                                        .action(ArgAction::Append)
                                        .required(true)
                                        .help("Mailbox domain (repeatable)"),
                                )
                                .arg(
                                    Arg::new("password")
                                        .long("password")
                                        .help("Password stored in the secret bundle"),
                                )
                                .arg(
                                    Arg::new("admin")
                                        .long("admin")
                                        .action(ArgAction::SetTrue)
                                        .help("Grant the admin role"),
                                )
                                .arg(
                                    Arg::new("quota")
                                        .long("quota")
                                        .default_value("1G")
                                        .help("Mailbox quota, e.g. 512M or 1G"),
                                ),
                        )
                        .subcommand(Command::new("list").alias("ls").about("List users"))
                        .subcommand(
                            Command::new("delete")
                                .alias("del")
                                .about("Delete a user")
                                .arg(Arg::new("USERNAME").required(true)),
                        ),
                )
                .subcommand(
                    Command::new("domain")
                        .about("Manage hosted domains")
                        .arg_required_else_help(true)
                        .subcommand(
                            Command::new("add")
                                .about("Add a domain")
                                .arg(Arg::new("NAME").required(true))
                                .arg(
                                    Arg::new("mx")
                                        .long("mx")
                                        .action(ArgAction::Append)
                                        .help("MX target hostname (repeatable)"),
                                )
                                .arg(
                                    Arg::new("a-record")
                                        .long("a-record")
                                        .action(ArgAction::Append)
                                        .help("Host record as name=ipv4 (repeatable)"),
                                )
                                .arg(
                                    Arg::new("certificate-mode")
                                        .long("certificate-mode")
                                        .value_parser(["none", "self_signed", "acme"])
                                        .help("Certificate policy (defaults to the environment's)"),
                                ),
                        )
                        .subcommand(Command::new("list").alias("ls").about("List domains")),
                ),
        )
        .subcommand(
            Command::new("certificates")
                .alias("certs")
                .about("Inspect and provision certificates")
                .arg_required_else_help(true)
                .subcommand(Command::new("list").alias("ls").about("List certificates"))
                .subcommand(
                    Command::new("info")
                        .about("Show one certificate record")
                        .arg(domain_arg.clone()),
                )
                .subcommand(
                    Command::new("provision-self-signed")
                        .about("Issue a self-signed certificate for a domain")
                        .arg(domain_arg.clone())
                        .arg(force_flag.clone()),
                )
                .subcommand(
                    Command::new("provision-acme")
                        .about("Order an ACME certificate for a domain")
                        .arg(domain_arg.clone())
                        .arg(force_flag.clone()),
                ),
        )
}
