mod flow;
mod helpers;
mod lifecycle;
