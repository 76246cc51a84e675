use structopt::StructOpt;

fn main() {
    let opt = mailrelay::Opt::from_args();
    mailrelay::init_logging(&opt);

    // TODO: install a signal handler that drops `signal` so that
    // SIGTERM shuts the units down with a reason instead of killing
    // the process outright
    let (_signal, shutdown) = smol::channel::unbounded::<()>();

    if let Err(e) = mailrelay::run(&opt, shutdown) {
        eprintln!("mailrelay: {:#}", e);
        std::process::exit(mailrelay::exit_code(&e));
    }
}
