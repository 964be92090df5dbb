fn main() {
    use atlas_graph::cli::parse;
    let cli = parse();
    let code = atlas_graph::app::run_cli(cli);
    if code != 0 {
        std::process::exit(code);
    }
}
