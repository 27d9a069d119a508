fn main() {
    // Build scripts run on the host; only pull in the ESP-IDF environment
    // when cross-compiling for an `*-espidf` target (Xtensa or RISC-V)
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.ends_with("-espidf") {
        embuild::espidf::sysenv::output();
    }
}
