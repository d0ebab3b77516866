fn main() {
    let args = std::env::args_os().collect::<Vec<_>>();
    std::process::exit(match makemesh::cli::run_makemesh(args.as_slice()) {
        Ok(_) => 0,
        Err(err) => makemesh::cli::exit_code(&err),
    });
}
