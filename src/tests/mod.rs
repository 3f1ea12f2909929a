
mod islands;
mod pf;
