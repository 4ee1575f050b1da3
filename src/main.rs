fn main() {
    busprobe::cli::main();
}
