fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let opts = match upgrade_installer::CliOptions::parse(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("upgrade-installer: {}", e);
            eprintln!("{}", upgrade_installer::USAGE);
            std::process::exit(upgrade_installer::EXIT_CONFIG);
        }
    };

    if opts.help {
        println!("{}", upgrade_installer::USAGE);
        return;
    }

    std::process::exit(upgrade_installer::run_cli(&opts));
}
