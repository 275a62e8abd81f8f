use survey_merge::error::user_facing;

fn main() {
    if let Err(err) = survey_merge::run() {
        eprintln!("error: {}", user_facing(&err));
        std::process::exit(1);
    }
}
