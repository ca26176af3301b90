#[rocket::launch]
fn rocket() -> _ {
    inbox_indexer::rocket()
}
