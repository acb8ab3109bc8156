use claude_proxy::cli::run_claude_proxy;

fn main() {
    if let Err(err) = run_claude_proxy() {
        tracing::error!(error = %err, "claude-proxy failed");
        eprintln!("{err}");
        std::process::exit(1);
    }
}
