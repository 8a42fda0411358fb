fn main() {
    careflow_lib::run()
}
