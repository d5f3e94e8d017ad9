use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        // A device PAC is selected, so the real `QUADSPI` register block is available.
        pac_regs: { any(feature = "f7", feature = "h7") },
    }
}
